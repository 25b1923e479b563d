//! Field-update dispatch.
//!
//! Resolves the field and target object of an update, checks that a client
//! sender may send the field, decodes the value and hands it to the object's
//! behavior. Decode and handler failures stop at this boundary: they are
//! logged and the next datagram is processed normally.

use crate::error::AiError;
use crate::object::ObjectContext;
use crate::table::ObjectTable;
use log::{debug, warn};
use shared::{hex, Channel, ClientChannelRange, DatagramIterator, DoId, FieldDef};

/// Checks whether `sender` may send `field` to object `do_id`.
///
/// Non-client senders are trusted. A client may send `clsend` fields to any
/// object, and `ownsend` fields only to its own avatar.
pub fn authorize(
    field: &FieldDef,
    sender: Channel,
    do_id: DoId,
    client_range: &ClientChannelRange,
) -> Result<(), AiError> {
    let identity = match client_range.identity(sender) {
        Some(identity) => identity,
        None => return Ok(()),
    };

    if field.flags.clsend || (field.flags.ownsend && identity.avatar_id == do_id) {
        return Ok(());
    }

    Err(AiError::Unauthorized {
        sender,
        do_id,
        field: field.name.clone(),
    })
}

/// Describes the current sender for log lines.
pub fn describe_sender(ctx: &ObjectContext<'_>) -> String {
    match (ctx.sender, ctx.sender_identity()) {
        (Some(channel), Some(identity)) => format!(
            "channel {} (account {}, avatar {})",
            channel, identity.account_id, identity.avatar_id
        ),
        (Some(channel), None) => format!("channel {}", channel),
        (None, _) => "unknown sender".to_string(),
    }
}

/// Handles the body of an update-field datagram: `[doId:u32][field:u16][value]`.
pub fn dispatch_update(
    objects: &mut ObjectTable,
    ctx: &ObjectContext<'_>,
    dgi: &mut DatagramIterator<'_>,
) -> Result<(), AiError> {
    let do_id = dgi.get_u32()?;
    let number = dgi.get_u16()?;

    let field = ctx.schema.field(number).ok_or(AiError::UnknownField(number))?;
    let entry = objects.get_mut(do_id).ok_or(AiError::UnknownObject(do_id))?;

    let class_id = entry.core.class_id;
    let class = ctx.schema.class(class_id).ok_or(AiError::UnknownType(class_id))?;
    if !class.has_field(number) {
        return Err(AiError::FieldNotInClass { do_id, field: number });
    }

    if let Some(sender) = ctx.sender {
        authorize(field, sender, do_id, &ctx.client_range)?;
    }

    let start = dgi.tell();
    let args = match field.unpack(dgi) {
        Ok(args) => args,
        Err(e) => {
            warn!(
                "Failed to decode {} for object {} from {}: {} (remaining: {})",
                field.name,
                do_id,
                describe_sender(ctx),
                e,
                hex(dgi.remaining_bytes())
            );
            return Ok(());
        }
    };
    let raw = dgi.slice_from(start);

    debug!("Update {} on object {} from {}", field.name, do_id, describe_sender(ctx));

    if let Err(e) = entry.behavior.handle_update(&mut entry.core, ctx, field, args, raw) {
        warn!(
            "Handler for {} on object {} failed for {}: {} (datagram value: {})",
            field.name,
            do_id,
            describe_sender(ctx),
            e,
            hex(raw)
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectCore, ObjectEntry, PassiveBehavior};
    use shared::{Datagram, Outbox, Schema, SenderIdentity, Value};

    const TOON_SCHEMA: &str = include_str!("../../dclass/toon.json");
    const TOON_CLASS: u16 = 3;
    const SET_HP: u16 = 4;
    const SET_TALK: u16 = 5;
    const SET_ANIM_STATE: u16 = 6;
    const ACCOUNT_AV_SET: u16 = 10;

    fn client(avatar_id: u32) -> Channel {
        ClientChannelRange::default()
            .channel_for(SenderIdentity {
                account_id: 1,
                avatar_id,
            })
            .unwrap()
    }

    fn run(
        schema: &Schema,
        objects: &mut ObjectTable,
        sender: Option<Channel>,
        body: &Datagram,
    ) -> Result<(), AiError> {
        let (outbox, _rx) = Outbox::channel();
        let ctx = ObjectContext {
            schema,
            outbox: &outbox,
            our_channel: 4_000_000,
            sender,
            client_range: ClientChannelRange::default(),
        };
        dispatch_update(objects, &ctx, &mut body.iter())
    }

    fn toon_table() -> ObjectTable {
        let mut objects = ObjectTable::new();
        objects.insert(ObjectEntry::new(
            ObjectCore::new(100_000_001, TOON_CLASS),
            Box::new(PassiveBehavior),
        ));
        objects
    }

    fn update(do_id: DoId, field: u16, value: impl FnOnce(&mut Datagram)) -> Datagram {
        let mut dg = Datagram::new();
        dg.add_u32(do_id);
        dg.add_u16(field);
        value(&mut dg);
        dg
    }

    #[test]
    fn test_update_stored_by_default_handler() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();

        let body = update(100_000_001, SET_HP, |dg| dg.add_i16(-3));
        run(&schema, &mut objects, Some(4002), &body).unwrap();

        let core = &objects.get(100_000_001).unwrap().core;
        assert_eq!(core.field_value(&schema, "setHp"), Some(vec![Value::Int(-3)]));
    }

    #[test]
    fn test_unknown_field_and_object() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();

        let body = update(100_000_001, 999, |_| {});
        assert!(matches!(
            run(&schema, &mut objects, None, &body),
            Err(AiError::UnknownField(999))
        ));

        let body = update(42, SET_HP, |dg| dg.add_i16(1));
        assert!(matches!(
            run(&schema, &mut objects, None, &body),
            Err(AiError::UnknownObject(42))
        ));
    }

    #[test]
    fn test_field_of_other_class_rejected() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();

        let body = update(100_000_001, ACCOUNT_AV_SET, |dg| dg.add_u16(0));
        assert!(matches!(
            run(&schema, &mut objects, None, &body),
            Err(AiError::FieldNotInClass { field: ACCOUNT_AV_SET, .. })
        ));
    }

    #[test]
    fn test_decode_error_is_swallowed() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();

        // setHp needs two bytes.
        let body = update(100_000_001, SET_HP, |dg| dg.add_u8(1));
        assert!(run(&schema, &mut objects, Some(4002), &body).is_ok());
        assert!(objects.get(100_000_001).unwrap().core.field(SET_HP).is_none());
    }

    #[test]
    fn test_client_clsend_allowed() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();

        let body = update(100_000_001, SET_TALK, |dg| dg.add_string16("hi").unwrap());
        assert!(run(&schema, &mut objects, Some(client(100_000_777)), &body).is_ok());
        assert!(objects.get(100_000_001).unwrap().core.field(SET_TALK).is_some());
    }

    #[test]
    fn test_client_ownsend_only_for_own_avatar() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();
        let body = update(100_000_001, SET_ANIM_STATE, |dg| dg.add_string16("run").unwrap());

        assert!(matches!(
            run(&schema, &mut objects, Some(client(100_000_002)), &body),
            Err(AiError::Unauthorized { .. })
        ));
        assert!(run(&schema, &mut objects, Some(client(100_000_001)), &body).is_ok());
    }

    #[test]
    fn test_client_cannot_send_server_field() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let mut objects = toon_table();
        let body = update(100_000_001, SET_HP, |dg| dg.add_i16(999));

        assert!(matches!(
            run(&schema, &mut objects, Some(client(100_000_001)), &body),
            Err(AiError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_describe_sender() {
        let schema = Schema::from_json(TOON_SCHEMA).unwrap();
        let (outbox, _rx) = Outbox::channel();
        let mut ctx = ObjectContext {
            schema: &schema,
            outbox: &outbox,
            our_channel: 4_000_000,
            sender: Some(4002),
            client_range: ClientChannelRange::default(),
        };
        assert_eq!(describe_sender(&ctx), "channel 4002");

        ctx.sender = Some(client(5));
        assert!(describe_sender(&ctx).contains("avatar 5"));

        ctx.sender = None;
        assert_eq!(describe_sender(&ctx), "unknown sender");
    }
}

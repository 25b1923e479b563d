//! Distributed objects as seen by the AI node.
//!
//! An object is split into [`ObjectCore`], the state every object shares
//! (id, class, location, field values, update queue), and an
//! [`ObjectBehavior`] supplied by the type registry that reacts to lifecycle
//! and interest events.

use crate::error::AiError;
use log::debug;
use shared::msgtypes::STATESERVER_OBJECT_UPDATE_FIELD;
use shared::{
    Channel, ClientChannelRange, Datagram, DoId, FieldDef, Outbox, Schema, SchemaError,
    SenderIdentity, Value,
};
use std::collections::{HashMap, VecDeque};

/// Lifecycle state of a distributed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Id allocated, generate not yet sent
    Reserved,
    /// Generate sent, waiting for the state server's enter echo
    PendingAck,
    Active,
    Deleted,
}

/// Parent object and zone. Zero in either slot means "nowhere".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub parent: DoId,
    pub zone: u32,
}

impl Location {
    pub fn new(parent: DoId, zone: u32) -> Self {
        Self { parent, zone }
    }
}

/// Read-only node state handed to object hooks.
pub struct ObjectContext<'a> {
    pub schema: &'a Schema,
    pub outbox: &'a Outbox,
    pub our_channel: Channel,
    /// Sender of the datagram being processed, if any
    pub sender: Option<Channel>,
    pub client_range: ClientChannelRange,
}

impl<'a> ObjectContext<'a> {
    /// Identity of the current sender if it is a client channel.
    pub fn sender_identity(&self) -> Option<SenderIdentity> {
        self.sender.and_then(|channel| self.client_range.identity(channel))
    }

    pub fn sender_avatar_id(&self) -> Option<u32> {
        self.sender_identity().map(|identity| identity.avatar_id)
    }

    pub fn sender_account_id(&self) -> Option<u32> {
        self.sender_identity().map(|identity| identity.account_id)
    }
}

/// The child side of an interest notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub do_id: DoId,
    /// `None` when the child itself is not resident on this node
    pub class_id: Option<u16>,
}

/// State shared by every distributed object.
#[derive(Debug)]
pub struct ObjectCore {
    pub do_id: DoId,
    pub class_id: u16,
    pub location: Location,
    pub state: ObjectState,
    /// Packed field values keyed by field number
    fields: HashMap<u16, Vec<u8>>,
    /// Updates held back until the generate is acknowledged
    pending: Option<VecDeque<Datagram>>,
    /// True when this node allocated the id
    pub owned_channel: bool,
}

impl ObjectCore {
    pub fn new(do_id: DoId, class_id: u16) -> Self {
        Self {
            do_id,
            class_id,
            location: Location::default(),
            state: ObjectState::Reserved,
            fields: HashMap::new(),
            pending: None,
            owned_channel: false,
        }
    }

    pub fn field(&self, number: u16) -> Option<&[u8]> {
        self.fields.get(&number).map(Vec::as_slice)
    }

    pub fn set_field_raw(&mut self, number: u16, bytes: Vec<u8>) {
        self.fields.insert(number, bytes);
    }

    /// Decodes a stored field by name.
    pub fn field_value(&self, schema: &Schema, name: &str) -> Option<Vec<Value>> {
        let field = self.resolve(schema, name).ok()?;
        let bytes = self.fields.get(&field.number)?;
        field.unpack_value(bytes).ok()
    }

    /// Marks the object as waiting for its generate echo; updates sent from
    /// now on are queued.
    pub fn begin_pending(&mut self) {
        self.state = ObjectState::PendingAck;
        self.pending = Some(VecDeque::new());
    }

    pub fn is_queueing(&self) -> bool {
        self.pending.is_some()
    }

    pub fn queued_updates(&self) -> usize {
        self.pending.as_ref().map_or(0, VecDeque::len)
    }

    /// Sends queued updates in order, disables queueing and activates the
    /// object. Returns the number of datagrams flushed.
    pub fn flush(&mut self, outbox: &Outbox) -> usize {
        let mut flushed = 0;
        if let Some(queue) = self.pending.take() {
            for dg in queue {
                outbox.send(dg);
                flushed += 1;
            }
        }
        self.state = ObjectState::Active;
        flushed
    }

    fn resolve<'s>(&self, schema: &'s Schema, name: &str) -> Result<&'s FieldDef, AiError> {
        let class = schema
            .class(self.class_id)
            .ok_or(AiError::UnknownType(self.class_id))?;
        schema.class_field(class, name).ok_or_else(|| {
            AiError::Schema(SchemaError::UnknownField {
                class: class.name.clone(),
                field: name.to_string(),
            })
        })
    }

    fn build_update(
        &self,
        ctx: &ObjectContext<'_>,
        recipient: Channel,
        field: &FieldDef,
        args: &[Value],
    ) -> Result<Datagram, AiError> {
        let mut dg = Datagram::server(
            &[recipient],
            ctx.our_channel,
            STATESERVER_OBJECT_UPDATE_FIELD,
        );
        dg.add_u32(self.do_id);
        dg.add_u16(field.number);
        field.pack(&mut dg, args)?;
        Ok(dg)
    }

    /// Stores and broadcasts a field update on the object's own channel.
    ///
    /// While the generate is unacknowledged the datagram is queued instead.
    pub fn send_update(
        &mut self,
        ctx: &ObjectContext<'_>,
        name: &str,
        args: &[Value],
    ) -> Result<(), AiError> {
        let field = self.resolve(ctx.schema, name)?;
        let dg = self.build_update(ctx, self.do_id as Channel, field, args)?;
        self.fields.insert(field.number, field.pack_value(args)?);

        match self.pending.as_mut() {
            Some(queue) => {
                debug!("Queueing {} for object {} until generate echo", name, self.do_id);
                queue.push_back(dg);
            }
            None => {
                ctx.outbox.send(dg);
            }
        }
        Ok(())
    }

    /// Sends a field update to an arbitrary channel, e.g. a reply to the
    /// current sender. Never queued.
    pub fn send_update_to_channel(
        &self,
        ctx: &ObjectContext<'_>,
        channel: Channel,
        name: &str,
        args: &[Value],
    ) -> Result<(), AiError> {
        let field = self.resolve(ctx.schema, name)?;
        let dg = self.build_update(ctx, channel, field, args)?;
        ctx.outbox.send(dg);
        Ok(())
    }
}

/// Per-class behavior attached to an object.
///
/// Every hook has a no-op default except [`ObjectBehavior::handle_update`],
/// which stores the raw field value.
pub trait ObjectBehavior: Send {
    fn on_generate(&mut self, _core: &mut ObjectCore, _ctx: &ObjectContext<'_>) {}

    fn on_delete(&mut self, _core: &mut ObjectCore, _ctx: &ObjectContext<'_>) {}

    fn handle_child_arrive(&mut self, _core: &mut ObjectCore, _child: &ChildRef, _zone: u32) {}

    fn handle_child_arrive_zone(&mut self, _core: &mut ObjectCore, _child: &ChildRef, _zone: u32) {}

    fn handle_child_leave(&mut self, _core: &mut ObjectCore, _child: &ChildRef, _zone: u32) {}

    fn handle_child_leave_zone(&mut self, _core: &mut ObjectCore, _child: &ChildRef, _zone: u32) {}

    /// Applies a decoded field update.
    fn handle_update(
        &mut self,
        core: &mut ObjectCore,
        _ctx: &ObjectContext<'_>,
        field: &FieldDef,
        _args: Vec<Value>,
        raw: &[u8],
    ) -> Result<(), AiError> {
        core.set_field_raw(field.number, raw.to_vec());
        Ok(())
    }
}

/// Behavior for classes with no game logic of their own.
#[derive(Debug, Default)]
pub struct PassiveBehavior;

impl ObjectBehavior for PassiveBehavior {}

/// A resident object.
pub struct ObjectEntry {
    pub core: ObjectCore,
    pub behavior: Box<dyn ObjectBehavior>,
}

impl ObjectEntry {
    pub fn new(core: ObjectCore, behavior: Box<dyn ObjectBehavior>) -> Self {
        Self { core, behavior }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::DatagramHeader;

    const SCHEMA: &str = r#"{
        "version": 1,
        "classes": [
            { "name": "Thing", "fields": [
                { "name": "setLabel", "params": ["string"], "keywords": ["required", "broadcast", "ram"] },
                { "name": "setCount", "params": ["uint16"], "keywords": ["broadcast"] }
            ] }
        ]
    }"#;

    fn context<'a>(schema: &'a Schema, outbox: &'a Outbox) -> ObjectContext<'a> {
        ObjectContext {
            schema,
            outbox,
            our_channel: 4_000_000,
            sender: None,
            client_range: ClientChannelRange::default(),
        }
    }

    #[test]
    fn test_send_update_goes_out_when_active() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let (outbox, mut rx) = Outbox::channel();
        let ctx = context(&schema, &outbox);
        let mut core = ObjectCore::new(4_000_001, 0);

        core.send_update(&ctx, "setCount", &[Value::UInt(9)]).unwrap();

        let dg = rx.try_recv().unwrap();
        let mut dgi = dg.iter();
        let header = dgi.read_header().unwrap();
        assert_eq!(
            header,
            DatagramHeader::Server {
                recipients: vec![4_000_001],
                sender: 4_000_000,
                msg_type: STATESERVER_OBJECT_UPDATE_FIELD,
            }
        );
        assert_eq!(dgi.get_u32().unwrap(), 4_000_001);
        assert_eq!(dgi.get_u16().unwrap(), 1);
        assert_eq!(dgi.get_u16().unwrap(), 9);
        assert_eq!(core.field_value(&schema, "setCount"), Some(vec![Value::UInt(9)]));
    }

    #[test]
    fn test_updates_queued_until_flush() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let (outbox, mut rx) = Outbox::channel();
        let ctx = context(&schema, &outbox);
        let mut core = ObjectCore::new(4_000_001, 0);
        core.begin_pending();

        core.send_update(&ctx, "setCount", &[Value::UInt(1)]).unwrap();
        core.send_update(&ctx, "setCount", &[Value::UInt(2)]).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(core.queued_updates(), 2);

        assert_eq!(core.flush(&outbox), 2);
        assert_eq!(core.state, ObjectState::Active);
        assert!(!core.is_queueing());

        for expected in [1u16, 2] {
            let dg = rx.try_recv().unwrap();
            let mut dgi = dg.iter();
            dgi.read_header().unwrap();
            dgi.get_u32().unwrap();
            dgi.get_u16().unwrap();
            assert_eq!(dgi.get_u16().unwrap(), expected);
        }

        // A second flush sends nothing.
        assert_eq!(core.flush(&outbox), 0);
    }

    #[test]
    fn test_send_update_to_channel_bypasses_queue() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let (outbox, mut rx) = Outbox::channel();
        let ctx = context(&schema, &outbox);
        let mut core = ObjectCore::new(4_000_001, 0);
        core.begin_pending();

        core.send_update_to_channel(&ctx, 1 << 32, "setLabel", &[Value::from("hi")])
            .unwrap();

        let dg = rx.try_recv().unwrap();
        let header = dg.iter().read_header().unwrap();
        assert!(matches!(
            header,
            DatagramHeader::Server { ref recipients, .. } if recipients == &vec![1u64 << 32]
        ));
    }

    #[test]
    fn test_send_update_unknown_field() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let (outbox, _rx) = Outbox::channel();
        let ctx = context(&schema, &outbox);
        let mut core = ObjectCore::new(4_000_001, 0);

        assert!(matches!(
            core.send_update(&ctx, "setNothing", &[]),
            Err(AiError::Schema(SchemaError::UnknownField { .. }))
        ));
    }

    #[test]
    fn test_sender_identity_from_context() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let (outbox, _rx) = Outbox::channel();
        let mut ctx = context(&schema, &outbox);

        assert_eq!(ctx.sender_identity(), None);

        ctx.sender = Some((1u64 << 32) + (3u64 << 32) + 100_000_005);
        assert_eq!(ctx.sender_account_id(), Some(3));
        assert_eq!(ctx.sender_avatar_id(), Some(100_000_005));

        ctx.sender = Some(4_000_000);
        assert_eq!(ctx.sender_avatar_id(), None);
    }
}

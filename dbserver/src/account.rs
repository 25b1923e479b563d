//! Account-level operations: avatar slots, wish names and the account summary.

use crate::backend::{DatabaseBackend, StoredObject};
use crate::error::{BackendError, DbError};
use log::debug;
use shared::{Datagram, DoId, Schema, Value};

pub const AV_SET: &str = "ACCOUNT_AV_SET";
pub const AV_SET_DEL: &str = "ACCOUNT_AV_SET_DEL";

const NAME: &str = "setName";
const DNA: &str = "setDNAString";
const WISH_NAME: &str = "WishName";
const WISH_NAME_STATE: &str = "WishNameState";

const STATE_OPEN: &str = "OPEN";
const STATE_APPROVED: &str = "APPROVED";
const STATE_REJECTED: &str = "REJECTED";

/// Account operations against a backend, for one pair of account and
/// avatar classes.
pub struct Accounts<'a> {
    pub backend: &'a dyn DatabaseBackend,
    pub schema: &'a Schema,
    pub account_class: &'a str,
    pub avatar_class: &'a str,
}

impl<'a> Accounts<'a> {
    /// Fails with `NotFound` unless `account_id` is an object of the account class.
    pub async fn avatar_set(&self, account_id: DoId) -> Result<Vec<DoId>, DbError> {
        let account = self
            .backend
            .query_fields(account_id, &[AV_SET.to_string()])
            .await?;
        if account.class_name != self.account_class {
            return Err(BackendError::NotFound(account_id).into());
        }
        self.ids(&account, AV_SET)
    }

    /// Puts `avatar_id` into slot `slot` of the account's avatar set.
    pub async fn attach_avatar(
        &self,
        account_id: DoId,
        slot: u8,
        avatar_id: DoId,
    ) -> Result<(), DbError> {
        let mut av_set = self.avatar_set(account_id).await?;
        let slot = slot as usize;
        if av_set.len() <= slot {
            av_set.resize(slot + 1, 0);
        }
        av_set[slot] = avatar_id;

        let field = self.schema.field_by_name(self.account_class, AV_SET)?;
        let ids = av_set.into_iter().map(Value::from).collect();
        let packed = field.pack_value(&[Value::Array(ids)])?;
        self.backend.set_field(account_id, AV_SET, packed).await?;

        debug!("Account {} slot {} now holds avatar {}", account_id, slot, avatar_id);
        Ok(())
    }

    /// Resolves a pending wish name. Approval makes it the avatar's name;
    /// rejection reopens naming.
    pub async fn clear_wish_name(&self, avatar_id: DoId, approve: bool) -> Result<(), DbError> {
        let fields = if approve {
            let avatar = self
                .backend
                .query_fields(avatar_id, &[WISH_NAME.to_string()])
                .await?;
            let wish = self.string(&avatar, WISH_NAME)?;
            vec![
                (WISH_NAME_STATE, String::new()),
                (WISH_NAME, String::new()),
                (NAME, wish),
            ]
        } else {
            vec![
                (WISH_NAME_STATE, STATE_OPEN.to_string()),
                (WISH_NAME, String::new()),
            ]
        };

        let mut packed = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let field = self.schema.field_by_name(self.avatar_class, name)?;
            packed.push((name.to_string(), field.pack_value(&[Value::from(value)])?));
        }
        self.backend.set_fields(avatar_id, packed).await?;
        Ok(())
    }

    /// Appends the account summary: the packed deleted-avatar set, then one
    /// entry per occupied slot.
    pub async fn write_summary(&self, dg: &mut Datagram, account_id: DoId) -> Result<(), DbError> {
        let account = self
            .backend
            .query_fields(account_id, &[AV_SET.to_string(), AV_SET_DEL.to_string()])
            .await?;
        if account.class_name != self.account_class {
            return Err(BackendError::NotFound(account_id).into());
        }

        match account.field(AV_SET_DEL) {
            Some(bytes) => dg.add_bytes(bytes),
            None => {
                let field = self.schema.field_by_name(self.account_class, AV_SET_DEL)?;
                dg.add_bytes(&field.pack_value(&[Value::Array(Vec::new())])?);
            }
        }

        let av_set = self.ids(&account, AV_SET)?;
        let count = av_set.iter().filter(|id| **id != 0).count();
        dg.add_u16(count as u16);

        let wanted = [NAME, WISH_NAME_STATE, WISH_NAME, DNA].map(str::to_string);
        for (slot, avatar_id) in av_set.iter().copied().enumerate() {
            if avatar_id == 0 {
                continue;
            }
            let avatar = self.backend.query_fields(avatar_id, &wanted).await?;

            let wish = self.string(&avatar, WISH_NAME)?;
            let state = self.string(&avatar, WISH_NAME_STATE)?;
            let (pending, approved, rejected) = match state.as_str() {
                STATE_APPROVED => ("", wish.as_str(), ""),
                STATE_REJECTED => ("", "", wish.as_str()),
                _ => (wish.as_str(), "", ""),
            };

            dg.add_u32(avatar_id);
            dg.add_string16(&self.string(&avatar, NAME)?)?;
            dg.add_string16(pending)?;
            dg.add_string16(approved)?;
            dg.add_string16(rejected)?;
            dg.add_blob16(&self.blob(&avatar, DNA)?)?;
            dg.add_u8(slot as u8);
            dg.add_u8(u8::from(state == STATE_OPEN));
        }
        Ok(())
    }

    fn decode(&self, object: &StoredObject, name: &str) -> Result<Option<Value>, DbError> {
        let Some(bytes) = object.field(name) else {
            return Ok(None);
        };
        let field = self.schema.field_by_name(&object.class_name, name)?;
        Ok(field.unpack_value(bytes)?.into_iter().next())
    }

    fn string(&self, object: &StoredObject, name: &str) -> Result<String, DbError> {
        Ok(self
            .decode(object, name)?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default())
    }

    fn blob(&self, object: &StoredObject, name: &str) -> Result<Vec<u8>, DbError> {
        Ok(self
            .decode(object, name)?
            .and_then(|v| v.as_bytes().map(<[u8]>::to_vec))
            .unwrap_or_default())
    }

    fn ids(&self, object: &StoredObject, name: &str) -> Result<Vec<DoId>, DbError> {
        let ids = self
            .decode(object, name)?
            .and_then(|v| {
                v.as_array().map(|items| {
                    items.iter().filter_map(Value::as_u64).map(|id| id as DoId).collect()
                })
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

//! The AI node's state and its logic loop.
//!
//! [`AiRepository`] owns everything the node knows: allocators, the object
//! table, the interest maps and the outbox. It is owned by a single logic
//! task, which feeds it datagrams from the [`Bridge`] in arrival order.

use crate::dispatch::dispatch_update;
use crate::error::AiError;
use crate::interest::{change_location, InterestTable};
use crate::object::{Location, ObjectContext, ObjectCore, ObjectEntry, ObjectState};
use crate::registry::TypeRegistry;
use crate::table::ObjectTable;
use log::{debug, error, info, warn};
use shared::msgtypes::{self, *};
use shared::{
    AllocError, Bridge, Channel, ClientChannelRange, Datagram, DatagramHeader, DatagramIterator,
    DoId, IdAllocator, Outbox, Schema, SchemaError, Value, POLL_WAIT, STATESERVERS_CHANNEL,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Runtime settings of an AI node.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub md_host: String,
    pub md_port: u16,
    pub dclass_path: PathBuf,
    /// Channels and object ids issued by this node, `[min, max)`
    pub channel_min: Channel,
    pub channel_max: Channel,
    pub client_range: ClientChannelRange,
    pub district_name: String,
    pub district_class: String,
    pub avatar_class: String,
}

impl AiConfig {
    pub fn md_addr(&self) -> String {
        format!("{}:{}", self.md_host, self.md_port)
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            md_host: shared::DEFAULT_MD_HOST.to_string(),
            md_port: shared::DEFAULT_MD_PORT,
            dclass_path: PathBuf::from("dclass/toon.json"),
            channel_min: shared::AI_CHANNEL_MIN,
            channel_max: shared::AI_CHANNEL_MAX,
            client_range: ClientChannelRange::default(),
            district_name: "Sillyville".to_string(),
            district_class: "DistributedDistrict".to_string(),
            avatar_class: "DistributedToon".to_string(),
        }
    }
}

pub struct AiRepository {
    config: AiConfig,
    schema: Arc<Schema>,
    registry: TypeRegistry,
    channels: IdAllocator,
    zones: IdAllocator,
    our_channel: Channel,
    registered: HashSet<Channel>,
    objects: ObjectTable,
    interest: InterestTable,
    outbox: Outbox,
    current_sender: Option<Channel>,
    population: u32,
}

impl AiRepository {
    /// Creates the node state. The first channel of the range becomes the
    /// node's own channel.
    pub fn new(
        config: AiConfig,
        schema: Arc<Schema>,
        registry: TypeRegistry,
        outbox: Outbox,
    ) -> Result<Self, AiError> {
        let mut channels = IdAllocator::new(config.channel_min, config.channel_max);
        let our_channel = channels.allocate()?;

        Ok(Self {
            config,
            schema,
            registry,
            channels,
            zones: IdAllocator::new(shared::DYNAMIC_ZONE_MIN, shared::DYNAMIC_ZONE_MAX),
            our_channel,
            registered: HashSet::new(),
            objects: ObjectTable::new(),
            interest: InterestTable::new(),
            outbox,
            current_sender: None,
            population: 0,
        })
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn our_channel(&self) -> Channel {
        self.our_channel
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn interest(&self) -> &InterestTable {
        &self.interest
    }

    pub fn population(&self) -> u32 {
        self.population
    }

    /// Sender of the datagram currently being handled.
    pub fn current_sender(&self) -> Option<Channel> {
        self.current_sender
    }

    pub fn send(&self, dg: Datagram) {
        self.outbox.send(dg);
    }

    /// Hook context plus mutable access to the object table.
    fn parts(&mut self) -> (ObjectContext<'_>, &mut ObjectTable, &mut InterestTable) {
        (
            ObjectContext {
                schema: &self.schema,
                outbox: &self.outbox,
                our_channel: self.our_channel,
                sender: self.current_sender,
                client_range: self.config.client_range,
            },
            &mut self.objects,
            &mut self.interest,
        )
    }

    // Channels and zones

    pub fn allocate_channel(&mut self) -> Result<Channel, AiError> {
        Ok(self.channels.allocate()?)
    }

    pub fn free_channel(&mut self, channel: Channel) -> Result<(), AiError> {
        Ok(self.channels.free(channel)?)
    }

    /// Subscribes to `channel` on the broker. Repeat calls send nothing.
    pub fn register_channel(&mut self, channel: Channel) {
        if !self.registered.insert(channel) {
            return;
        }
        let mut dg = Datagram::control(CONTROL_SET_CHANNEL);
        dg.add_channel(channel);
        self.send(dg);
        debug!("Registered channel {}", channel);
    }

    pub fn unregister_channel(&mut self, channel: Channel) {
        if !self.registered.remove(&channel) {
            return;
        }
        let mut dg = Datagram::control(CONTROL_REMOVE_CHANNEL);
        dg.add_channel(channel);
        self.send(dg);
        debug!("Unregistered channel {}", channel);
    }

    pub fn is_registered(&self, channel: Channel) -> bool {
        self.registered.contains(&channel)
    }

    pub fn allocate_zone(&mut self) -> Result<u32, AiError> {
        let zone = self.zones.allocate()?;
        // The dynamic zone range lies below 2^20.
        u32::try_from(zone).map_err(|_| AiError::ResourceExhausted(AllocError::OutOfRange(zone)))
    }

    pub fn deallocate_zone(&mut self, zone: u32) -> Result<(), AiError> {
        Ok(self.zones.free(zone as u64)?)
    }

    /// Hands the broker a datagram to emit when this node disconnects.
    pub fn add_post_remove(&self, dg: &Datagram) {
        let mut control = Datagram::control(CONTROL_ADD_POST_REMOVE);
        control.add_bytes(dg.as_bytes());
        self.send(control);
    }

    /// Asks the state servers to route AI traffic for `do_id` to this node.
    pub fn add_ai_recv(&self, do_id: DoId) {
        let mut dg = Datagram::server(
            &[STATESERVERS_CHANNEL],
            self.our_channel,
            STATESERVER_ADD_AI_RECV,
        );
        dg.add_u32(do_id);
        dg.add_channel(self.our_channel);
        self.send(dg);
    }

    // Outbound object operations

    /// Generates a new object of `class_name` at `location`.
    ///
    /// Every required field must be supplied; other fields are sent in the
    /// optional block. Updates sent before the state server echoes the
    /// generate back are queued on the object.
    pub fn generate_with_required(
        &mut self,
        class_name: &str,
        location: Location,
        fields: &[(&str, Vec<Value>)],
    ) -> Result<DoId, AiError> {
        let schema = Arc::clone(&self.schema);
        let class = schema
            .class_by_name(class_name)
            .ok_or_else(|| AiError::UnknownClass(class_name.to_string()))?;
        let behavior = self.registry.construct(class.id)?;

        let mut required = Vec::new();
        for field in schema.required_fields(class) {
            let args = fields
                .iter()
                .find(|(name, _)| *name == field.name)
                .map(|(_, args)| args)
                .ok_or_else(|| AiError::MissingRequired {
                    class: class.name.clone(),
                    field: field.name.clone(),
                })?;
            required.push((field.number, field.pack_value(args)?));
        }

        let mut other = Vec::new();
        for (name, args) in fields {
            let field = schema.class_field(class, name).ok_or_else(|| {
                AiError::Schema(SchemaError::UnknownField {
                    class: class.name.clone(),
                    field: name.to_string(),
                })
            })?;
            if !field.flags.required {
                other.push((field.number, field.pack_value(args)?));
            }
        }

        let channel = self.channels.allocate()?;
        let do_id = match DoId::try_from(channel) {
            Ok(do_id) => do_id,
            Err(_) => {
                let _ = self.channels.free(channel);
                return Err(AiError::ResourceExhausted(AllocError::OutOfRange(channel)));
            }
        };

        let mut core = ObjectCore::new(do_id, class.id);
        core.owned_channel = true;

        let msg_type = if other.is_empty() {
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED
        } else {
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER
        };
        let mut dg = Datagram::server(&[STATESERVERS_CHANNEL], self.our_channel, msg_type);
        dg.add_u32(location.parent);
        dg.add_u32(location.zone);
        dg.add_u16(class.id);
        dg.add_u32(do_id);
        for (number, bytes) in &required {
            dg.add_bytes(bytes);
            core.set_field_raw(*number, bytes.clone());
        }
        if !other.is_empty() {
            dg.add_u16(other.len() as u16);
            for (number, bytes) in &other {
                dg.add_u16(*number);
                dg.add_bytes(bytes);
                core.set_field_raw(*number, bytes.clone());
            }
        }

        self.send(dg);
        core.begin_pending();
        info!("Generating {} {} at {:?}", class.name, do_id, location);

        if self.registry.is_session_bearing(class.id) {
            self.population += 1;
        }
        self.objects.insert(ObjectEntry::new(core, behavior));

        let (ctx, objects, interest) = self.parts();
        change_location(objects, interest, do_id, Location::default(), location);
        if let Some(entry) = objects.get_mut(do_id) {
            entry.behavior.on_generate(&mut entry.core, &ctx);
        }

        Ok(do_id)
    }

    /// Sends a field update for a resident object.
    pub fn send_update(&mut self, do_id: DoId, field: &str, args: &[Value]) -> Result<(), AiError> {
        let (ctx, objects, _) = self.parts();
        let entry = objects.get_mut(do_id).ok_or(AiError::UnknownObject(do_id))?;
        entry.core.send_update(&ctx, field, args)
    }

    /// Sends a field update for a resident object to an arbitrary channel.
    pub fn send_update_to_channel(
        &mut self,
        do_id: DoId,
        channel: Channel,
        field: &str,
        args: &[Value],
    ) -> Result<(), AiError> {
        let (ctx, objects, _) = self.parts();
        let entry = objects.get(do_id).ok_or(AiError::UnknownObject(do_id))?;
        entry.core.send_update_to_channel(&ctx, channel, field, args)
    }

    /// Replies to the sender of the datagram being handled.
    pub fn reply_update(
        &mut self,
        do_id: DoId,
        field: &str,
        args: &[Value],
    ) -> Result<(), AiError> {
        let sender = self.current_sender.ok_or(AiError::NoSender)?;
        self.send_update_to_channel(do_id, sender, field, args)
    }

    /// Asks the state server to delete an object. The local entry is only
    /// removed when the delete comes back.
    pub fn request_delete(&self, do_id: DoId) -> Result<(), AiError> {
        if !self.objects.contains(do_id) {
            return Err(AiError::UnknownObject(do_id));
        }
        let mut dg = Datagram::server(
            &[do_id as Channel],
            self.our_channel,
            STATESERVER_OBJECT_DELETE_RAM,
        );
        dg.add_u32(do_id);
        self.send(dg);
        Ok(())
    }

    /// Asks the state server to move an object.
    pub fn send_location(&self, do_id: DoId, old: Location, new: Location) {
        let mut dg = Datagram::server(
            &[do_id as Channel],
            self.our_channel,
            STATESERVER_OBJECT_SET_ZONE,
        );
        dg.add_u32(new.parent);
        dg.add_u32(new.zone);
        dg.add_u32(old.parent);
        dg.add_u32(old.zone);
        self.send(dg);
    }

    /// Opens interest for a client in `zones` under `parent`.
    pub fn set_interest(
        &self,
        client_channel: Channel,
        handle: u16,
        context: u32,
        parent: DoId,
        zones: &[u32],
    ) {
        let mut dg = Datagram::server(
            &[client_channel],
            self.our_channel,
            CLIENT_AGENT_SET_INTEREST,
        );
        dg.add_u16(handle);
        dg.add_u32(context);
        dg.add_u32(parent);
        for zone in zones {
            dg.add_u32(*zone);
        }
        self.send(dg);
    }

    pub fn remove_interest(&self, client_channel: Channel, handle: u16, context: u32) {
        let mut dg = Datagram::server(
            &[client_channel],
            self.our_channel,
            CLIENT_AGENT_REMOVE_INTEREST,
        );
        dg.add_u16(handle);
        dg.add_u32(context);
        self.send(dg);
    }

    // Inbound

    /// Handles one datagram. Failures are logged and never escape.
    pub fn handle_datagram(&mut self, dg: &Datagram) {
        let mut dgi = dg.iter();
        let header = match dgi.read_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping malformed datagram: {}", e);
                return;
            }
        };

        let (sender, msg_type) = match header {
            DatagramHeader::Server {
                sender, msg_type, ..
            } => (sender, msg_type),
            DatagramHeader::Control { msg_type } => {
                warn!("Ignoring control message {} addressed to an AI node", msg_type);
                return;
            }
        };

        self.current_sender = Some(sender);
        let result = match msg_type {
            STATESERVER_OBJECT_ENTER_AI_RECV => self.handle_enter(sender, &mut dgi),
            STATESERVER_OBJECT_DELETE_RAM => self.handle_exit(&mut dgi),
            STATESERVER_OBJECT_LEAVING_AI_INTEREST => Ok(()),
            STATESERVER_OBJECT_CHANGE_ZONE => self.handle_change_zone(&mut dgi),
            STATESERVER_OBJECT_UPDATE_FIELD => {
                if sender == self.our_channel {
                    Ok(())
                } else {
                    let (ctx, objects, _) = self.parts();
                    dispatch_update(objects, &ctx, &mut dgi)
                }
            }
            other => {
                debug!("Unhandled message type {} from {}", other, sender);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(
                "Dropped {} from channel {}: {}",
                msgtypes::name(msg_type),
                sender,
                e
            );
        }
        self.current_sender = None;
    }

    fn handle_enter(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), AiError> {
        let do_id = dgi.get_u32()?;
        let location = Location::new(dgi.get_u32()?, dgi.get_u32()?);
        let class_id = dgi.get_u16()?;

        if let Some(entry) = self.objects.get_mut(do_id) {
            // Echo of our own generate.
            let flushed = entry.core.flush(&self.outbox);
            debug!("Object {} acknowledged, flushed {} queued updates", do_id, flushed);
            return Ok(());
        }
        if sender == self.our_channel {
            debug!("Ignoring own enter echo for unknown object {}", do_id);
            return Ok(());
        }

        let schema = Arc::clone(&self.schema);
        let class = schema.class(class_id).ok_or(AiError::UnknownType(class_id))?;
        let behavior = self.registry.construct(class_id)?;

        let mut core = ObjectCore::new(do_id, class_id);
        for field in schema.required_fields(class) {
            let raw = field.unpack_raw(dgi)?;
            core.set_field_raw(field.number, raw.to_vec());
        }
        if dgi.remaining() > 0 {
            let count = dgi.get_u16()?;
            for _ in 0..count {
                let number = dgi.get_u16()?;
                let field = schema.field(number).ok_or(AiError::UnknownField(number))?;
                if !class.has_field(number) {
                    return Err(AiError::FieldNotInClass { do_id, field: number });
                }
                let raw = field.unpack_raw(dgi)?;
                core.set_field_raw(number, raw.to_vec());
            }
        }
        core.state = ObjectState::Active;

        info!("Object {} ({}) entered at {:?}", do_id, class.name, location);
        if self.registry.is_session_bearing(class_id) {
            self.population += 1;
        }
        self.objects.insert(ObjectEntry::new(core, behavior));

        let (ctx, objects, interest) = self.parts();
        change_location(objects, interest, do_id, Location::default(), location);
        if let Some(entry) = objects.get_mut(do_id) {
            entry.behavior.on_generate(&mut entry.core, &ctx);
        }
        Ok(())
    }

    fn handle_exit(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<(), AiError> {
        let do_id = dgi.get_u32()?;

        let mut entry = match self.objects.remove(do_id) {
            Some(entry) => entry,
            None => {
                info!("Received delete for unknown object {}", do_id);
                return Ok(());
            }
        };

        let location = entry.core.location;
        let (ctx, objects, interest) = self.parts();
        entry.behavior.on_delete(&mut entry.core, &ctx);
        change_location(objects, interest, do_id, location, Location::default());
        entry.core.state = ObjectState::Deleted;

        if self.registry.is_session_bearing(entry.core.class_id) {
            self.population = self.population.saturating_sub(1);
        }
        if entry.core.owned_channel {
            if let Err(e) = self.channels.free(do_id as Channel) {
                error!("Failed to release channel of object {}: {}", do_id, e);
            }
        }

        info!("Object {} deleted", do_id);
        Ok(())
    }

    fn handle_change_zone(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<(), AiError> {
        let do_id = dgi.get_u32()?;
        let new = Location::new(dgi.get_u32()?, dgi.get_u32()?);
        let claimed = Location::new(dgi.get_u32()?, dgi.get_u32()?);

        let old = match self.objects.get(do_id) {
            Some(entry) => entry.core.location,
            None => return Err(AiError::UnknownObject(do_id)),
        };
        if old != claimed {
            warn!(
                "Change-zone for {} claims it was at {:?} but it is at {:?}",
                do_id, claimed, old
            );
        }

        let (_, objects, interest) = self.parts();
        change_location(objects, interest, do_id, old, new);
        Ok(())
    }

    /// Drains the bridge until the connection is lost.
    pub async fn run(mut self, mut bridge: Bridge) -> Result<(), AiError> {
        loop {
            let batch = bridge.poll(POLL_WAIT).await?;
            for dg in &batch {
                self.handle_datagram(dg);
            }
        }
    }
}

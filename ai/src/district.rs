//! The district (shard) object and node bootstrap.

use crate::error::AiError;
use crate::object::{ChildRef, Location, ObjectBehavior, ObjectContext, ObjectCore};
use crate::repository::AiRepository;
use log::info;
use shared::msgtypes::STATESERVER_SHARD_REST;
use shared::{
    Datagram, DoId, Value, OTP_DO_ID_TOONTOWN, OTP_ZONE_ID_DISTRICTS, STATESERVERS_CHANNEL,
};
use std::collections::HashMap;

/// Tracks which zone of the district each child sits in.
///
/// A parent-only move fires just the parent hooks and a zone-only move fires
/// just the zone hooks, so both pairs keep the same child -> zone map.
#[derive(Debug, Default)]
pub struct DistrictBehavior {
    children: HashMap<DoId, u32>,
}

impl DistrictBehavior {
    pub fn zone_population(&self, zone: u32) -> u32 {
        self.children.values().filter(|z| **z == zone).count() as u32
    }

    pub fn total_population(&self) -> u32 {
        self.children.len() as u32
    }

    fn arrive(&mut self, child: &ChildRef, zone: u32) {
        if zone != 0 {
            self.children.insert(child.do_id, zone);
        }
    }

    fn leave(&mut self, child: &ChildRef, zone: u32) {
        if self.children.get(&child.do_id) == Some(&zone) {
            self.children.remove(&child.do_id);
        }
    }
}

impl ObjectBehavior for DistrictBehavior {
    fn on_generate(&mut self, core: &mut ObjectCore, ctx: &ObjectContext<'_>) {
        let name = core
            .field_value(ctx.schema, "setName")
            .and_then(|values| values.first().and_then(|v| v.as_str().map(str::to_string)))
            .unwrap_or_default();
        info!("District {} ({}) generated", core.do_id, name);
    }

    fn on_delete(&mut self, core: &mut ObjectCore, _ctx: &ObjectContext<'_>) {
        info!("District {} deleted", core.do_id);
    }

    fn handle_child_arrive(&mut self, _core: &mut ObjectCore, child: &ChildRef, zone: u32) {
        self.arrive(child, zone);
    }

    fn handle_child_arrive_zone(&mut self, _core: &mut ObjectCore, child: &ChildRef, zone: u32) {
        self.arrive(child, zone);
    }

    fn handle_child_leave(&mut self, _core: &mut ObjectCore, child: &ChildRef, zone: u32) {
        self.leave(child, zone);
    }

    fn handle_child_leave_zone(&mut self, _core: &mut ObjectCore, child: &ChildRef, zone: u32) {
        self.leave(child, zone);
    }
}

/// Brings the node online: subscribes to its own channel, generates the
/// district, arranges for the shard to be rested if the node disconnects,
/// claims AI traffic for the district and finally marks it available.
pub fn bootstrap(repo: &mut AiRepository) -> Result<DoId, AiError> {
    let our_channel = repo.our_channel();
    repo.register_channel(our_channel);

    let class = repo.config().district_class.clone();
    let name = repo.config().district_name.clone();
    let district = repo.generate_with_required(
        &class,
        Location::new(OTP_DO_ID_TOONTOWN, OTP_ZONE_ID_DISTRICTS),
        &[
            ("setName", vec![Value::from(name.as_str())]),
            ("setAvailable", vec![Value::from(false)]),
        ],
    )?;

    let mut shard_rest = Datagram::server(
        &[STATESERVERS_CHANNEL],
        our_channel,
        STATESERVER_SHARD_REST,
    );
    shard_rest.add_channel(our_channel);
    repo.add_post_remove(&shard_rest);

    repo.add_ai_recv(district);
    repo.send_update(district, "setAvailable", &[Value::from(true)])?;

    info!("District {} ({}) is up on channel {}", name, district, our_channel);
    Ok(district)
}

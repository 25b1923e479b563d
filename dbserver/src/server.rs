//! The database node: decodes requests off the bus and answers them from a
//! storage engine.
//!
//! Requests are parsed on the logic task in arrival order, then executed on
//! spawned tasks. Requests on the same object take turns through the
//! [`Sequencer`]; at most `pool_size` requests touch the backend at once.

use crate::account::Accounts;
use crate::backend::{BackendKind, DatabaseBackend, IdRange};
use crate::error::{BackendError, DbError};
use crate::sequencer::{Sequencer, Turn};
use log::{debug, error, info, warn};
use shared::msgtypes::{self, *};
use shared::{
    Bridge, Channel, Datagram, DatagramHeader, DatagramIterator, DoId, Outbox, Schema, POLL_WAIT,
    DBSERVERS_CHANNEL,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Status byte of get/set responses.
pub const STATUS_OK: u8 = 0;
pub const STATUS_NOT_FOUND: u8 = 1;
pub const STATUS_WRITE_FAILED: u8 = 2;
pub const STATUS_FAILED: u8 = 3;

/// Runtime settings of a database node.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub md_host: String,
    pub md_port: u16,
    pub dclass_path: PathBuf,
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub id_range: IdRange,
    /// Requests allowed to run against the backend concurrently
    pub pool_size: usize,
    pub account_class: String,
    pub avatar_class: String,
}

impl DbConfig {
    pub fn md_addr(&self) -> String {
        format!("{}:{}", self.md_host, self.md_port)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            md_host: shared::DEFAULT_MD_HOST.to_string(),
            md_port: shared::DEFAULT_MD_PORT,
            dclass_path: PathBuf::from("dclass/toon.json"),
            backend: BackendKind::Table,
            data_dir: PathBuf::from("data"),
            id_range: IdRange::default(),
            pool_size: 4,
            account_class: "Account".to_string(),
            avatar_class: "DistributedToon".to_string(),
        }
    }
}

#[derive(Debug)]
struct CreateRequest {
    context: u32,
    class_name: String,
    /// Account and slot the new avatar goes into
    account: Option<(DoId, u8)>,
    fields: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct GetRequest {
    context: u32,
    do_id: DoId,
    fields: Vec<(u16, String)>,
}

#[derive(Debug)]
struct SetRequest {
    do_id: DoId,
    fields: Vec<(String, Vec<u8>)>,
}

fn status_of(e: &DbError) -> u8 {
    match e {
        DbError::Backend(BackendError::NotFound(_)) => STATUS_NOT_FOUND,
        DbError::Backend(BackendError::WriteFailed(_)) => STATUS_WRITE_FAILED,
        _ => STATUS_FAILED,
    }
}

fn response(recipient: Channel, msg_type: u16) -> Datagram {
    Datagram::server(&[recipient], DBSERVERS_CHANNEL, msg_type)
}

/// State shared by every request task.
struct Worker {
    backend: Arc<dyn DatabaseBackend>,
    schema: Arc<Schema>,
    outbox: Outbox,
    account_class: String,
    avatar_class: String,
}

impl Worker {
    fn accounts(&self) -> Accounts<'_> {
        Accounts {
            backend: self.backend.as_ref(),
            schema: &self.schema,
            account_class: &self.account_class,
            avatar_class: &self.avatar_class,
        }
    }

    async fn create(&self, sender: Channel, request: CreateRequest) {
        let result = self.try_create(&request).await;

        let mut dg = response(sender, DBSERVER_CREATE_STORED_OBJECT_RESP);
        dg.add_u32(request.context);
        match result {
            Ok(do_id) => {
                info!("Created {} {} for channel {}", request.class_name, do_id, sender);
                dg.add_u8(0);
                dg.add_u32(do_id);
            }
            Err(e) => {
                warn!(
                    "{} from channel {} failed for class {}: {}",
                    msgtypes::name(DBSERVER_CREATE_STORED_OBJECT),
                    sender,
                    request.class_name,
                    e
                );
                dg.add_u8(1);
                dg.add_u32(0);
            }
        }
        self.outbox.send(dg);
    }

    async fn try_create(&self, request: &CreateRequest) -> Result<DoId, DbError> {
        // The account must exist before an avatar is created for it.
        if let Some((account_id, _)) = request.account {
            self.accounts()
                .avatar_set(account_id)
                .await
                .map_err(|e| BackendError::CreateFailed(format!("account {}: {}", account_id, e)))?;
        }

        let do_id = self
            .backend
            .create_object(&request.class_name, request.fields.clone())
            .await?;

        if let Some((account_id, slot)) = request.account {
            if let Err(e) = self.accounts().attach_avatar(account_id, slot, do_id).await {
                error!(
                    "Avatar {} is orphaned: created but not attached to slot {} of account {}: {}",
                    do_id, slot, account_id, e
                );
                return Err(e);
            }
        }
        Ok(do_id)
    }

    async fn get(&self, sender: Channel, request: GetRequest) {
        let names: Vec<String> = request.fields.iter().map(|(_, name)| name.clone()).collect();
        let result = self.backend.query_fields(request.do_id, &names).await;

        let mut dg = response(sender, DBSERVER_GET_STORED_VALUES_RESP);
        dg.add_u32(request.context);
        dg.add_u32(request.do_id);

        let object = match result {
            Ok(object) => object,
            Err(e) => {
                let e = DbError::from(e);
                warn!(
                    "{} from channel {} for object {}: {}",
                    msgtypes::name(DBSERVER_GET_STORED_VALUES),
                    sender,
                    request.do_id,
                    e
                );
                dg.add_u8(status_of(&e));
                dg.add_u16(0);
                self.outbox.send(dg);
                return;
            }
        };

        dg.add_u8(STATUS_OK);
        let count_pos = dg.tell();
        dg.add_u16(0);
        let mut count = 0u16;
        for (number, name) in &request.fields {
            if let Some(value) = object.field(name) {
                dg.add_u16(*number);
                dg.add_bytes(value);
                count += 1;
            }
        }
        dg.patch_u16(count_pos, count);

        debug!("Answered query for {} fields of {} from {}", count, request.do_id, sender);
        self.outbox.send(dg);
    }

    async fn set(&self, sender: Channel, request: SetRequest) {
        let status = match self.backend.set_fields(request.do_id, request.fields).await {
            Ok(()) => STATUS_OK,
            Err(e) => {
                let e = DbError::from(e);
                warn!(
                    "{} from channel {} for object {}: {}",
                    msgtypes::name(DBSERVER_SET_STORED_VALUES),
                    sender,
                    request.do_id,
                    e
                );
                status_of(&e)
            }
        };

        let mut dg = response(sender, DBSERVER_SET_STORED_VALUES_RESP);
        dg.add_u32(request.do_id);
        dg.add_u8(status);
        self.outbox.send(dg);
    }

    async fn clear_wish_name(&self, sender: Channel, avatar_id: DoId, approve: bool) {
        match self.accounts().clear_wish_name(avatar_id, approve).await {
            Ok(()) => info!(
                "Wish name of {} {}",
                avatar_id,
                if approve { "approved" } else { "rejected" }
            ),
            Err(e) => warn!(
                "{} from channel {} for object {}: {}",
                msgtypes::name(DBSERVER_WISHNAME_CLEAR),
                sender,
                avatar_id,
                e
            ),
        }
    }

    async fn account_query(&self, sender: Channel, account_id: DoId) {
        let mut dg = response(sender, DBSERVER_ACCOUNT_QUERY_RESP);
        if let Err(e) = self.accounts().write_summary(&mut dg, account_id).await {
            warn!(
                "{} from channel {} for object {}: {}",
                msgtypes::name(DBSERVER_ACCOUNT_QUERY),
                sender,
                account_id,
                e
            );
            // Answer with an empty account so the caller is not left waiting.
            dg = response(sender, DBSERVER_ACCOUNT_QUERY_RESP);
            dg.add_u16(0);
            dg.add_u16(0);
        }
        self.outbox.send(dg);
    }
}

/// The database node's state and logic loop.
pub struct DbServer {
    config: DbConfig,
    schema: Arc<Schema>,
    worker: Arc<Worker>,
    sequencer: Sequencer,
    pool: Arc<Semaphore>,
    tasks: Vec<JoinHandle<()>>,
}

impl DbServer {
    pub fn new(
        config: DbConfig,
        schema: Arc<Schema>,
        backend: Arc<dyn DatabaseBackend>,
        outbox: Outbox,
    ) -> Self {
        let worker = Arc::new(Worker {
            backend,
            schema: schema.clone(),
            outbox,
            account_class: config.account_class.clone(),
            avatar_class: config.avatar_class.clone(),
        });
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));

        Self {
            config,
            schema,
            worker,
            sequencer: Sequencer::new(),
            pool,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Prepares the backend and subscribes to the database channel.
    pub async fn start(&mut self) -> Result<(), DbError> {
        self.worker.backend.setup().await?;

        let mut dg = Datagram::control(CONTROL_SET_CHANNEL);
        dg.add_channel(DBSERVERS_CHANNEL);
        self.worker.outbox.send(dg);

        info!("Database node listening on channel {}", DBSERVERS_CHANNEL);
        Ok(())
    }

    /// Requests parsed but not yet answered.
    pub fn in_flight(&mut self) -> usize {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.len()
    }

    /// Waits until every request handed out so far has been answered.
    pub async fn flush(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Request task failed: {}", e);
            }
        }
    }

    /// Parses one datagram and schedules its work. Failures are logged and
    /// never escape.
    pub fn handle_datagram(&mut self, dg: &Datagram) {
        let mut dgi = dg.iter();
        let (sender, msg_type) = match dgi.read_header() {
            Ok(DatagramHeader::Server { sender, msg_type, .. }) => (sender, msg_type),
            Ok(DatagramHeader::Control { msg_type }) => {
                warn!("Ignoring control message {} addressed to a database node", msg_type);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed datagram: {}", e);
                return;
            }
        };

        let result = match msg_type {
            DBSERVER_CREATE_STORED_OBJECT => self.handle_create(sender, &mut dgi),
            DBSERVER_GET_STORED_VALUES => self.handle_get(sender, &mut dgi),
            DBSERVER_SET_STORED_VALUES => self.handle_set(sender, &mut dgi),
            DBSERVER_WISHNAME_CLEAR => self.handle_wish_name_clear(sender, &mut dgi),
            DBSERVER_ACCOUNT_QUERY => self.handle_account_query(sender, &mut dgi),
            DBSERVER_DELETE_STORED_OBJECT => self.handle_delete(sender, &mut dgi),
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
    }

    /// Runs `work` once the turn comes up and a pool slot is free.
    fn schedule<F, Fut>(&mut self, turn: Turn, work: F)
    where
        F: FnOnce(Arc<Worker>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());

        let job = work(self.worker.clone());
        let pool = self.pool.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut turn = turn;
            turn.wait().await;
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            job.await;
        }));
    }

    fn read_fields(
        &self,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<Vec<(String, Vec<u8>)>, DbError> {
        let count = dgi.get_u16()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let number = dgi.get_u16()?;
            let field = self.schema.field(number).ok_or(DbError::UnknownField(number))?;
            fields.push((field.name.clone(), field.unpack_raw(dgi)?.to_vec()));
        }
        Ok(fields)
    }

    fn parse_create(
        &self,
        context: u32,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<CreateRequest, DbError> {
        let class_id = dgi.get_u16()?;
        let class = self.schema.class(class_id).ok_or(DbError::UnknownClass(class_id))?;
        let account = if class.name == self.config.avatar_class {
            Some((dgi.get_u32()?, dgi.get_u8()?))
        } else {
            None
        };
        let fields = self.read_fields(dgi)?;

        Ok(CreateRequest {
            context,
            class_name: class.name.clone(),
            account,
            fields,
        })
    }

    fn handle_create(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let context = dgi.get_u32()?;
        let request = match self.parse_create(context, dgi) {
            Ok(request) => request,
            Err(e) => {
                let mut dg = response(sender, DBSERVER_CREATE_STORED_OBJECT_RESP);
                dg.add_u32(context);
                dg.add_u8(1);
                dg.add_u32(0);
                self.worker.outbox.send(dg);
                return Err(e);
            }
        };

        let turn = match request.account {
            Some((account_id, _)) => self.sequencer.enter(account_id),
            None => Turn::free(),
        };
        self.schedule(turn, move |worker| async move { worker.create(sender, request).await });
        Ok(())
    }

    fn handle_get(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let context = dgi.get_u32()?;
        let do_id = dgi.get_u32()?;

        let parsed = (|| {
            let count = dgi.get_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let number = dgi.get_u16()?;
                let field = self.schema.field(number).ok_or(DbError::UnknownField(number))?;
                fields.push((number, field.name.clone()));
            }
            Ok::<_, DbError>(fields)
        })();
        let fields = match parsed {
            Ok(fields) => fields,
            Err(e) => {
                let mut dg = response(sender, DBSERVER_GET_STORED_VALUES_RESP);
                dg.add_u32(context);
                dg.add_u32(do_id);
                dg.add_u8(STATUS_FAILED);
                dg.add_u16(0);
                self.worker.outbox.send(dg);
                return Err(e);
            }
        };

        let request = GetRequest { context, do_id, fields };
        let turn = self.sequencer.enter(do_id);
        self.schedule(turn, move |worker| async move { worker.get(sender, request).await });
        Ok(())
    }

    fn handle_set(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let do_id = dgi.get_u32()?;
        let fields = match self.read_fields(dgi) {
            Ok(fields) => fields,
            Err(e) => {
                let mut dg = response(sender, DBSERVER_SET_STORED_VALUES_RESP);
                dg.add_u32(do_id);
                dg.add_u8(STATUS_FAILED);
                self.worker.outbox.send(dg);
                return Err(e);
            }
        };

        let request = SetRequest { do_id, fields };
        let turn = self.sequencer.enter(do_id);
        self.schedule(turn, move |worker| async move { worker.set(sender, request).await });
        Ok(())
    }

    fn handle_wish_name_clear(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let avatar_id = dgi.get_u32()?;
        let approve = dgi.get_u8()? == 1;

        let turn = self.sequencer.enter(avatar_id);
        self.schedule(turn, move |worker| async move {
            worker.clear_wish_name(sender, avatar_id, approve).await
        });
        Ok(())
    }

    /// Stored objects are never deleted; the request is only logged.
    fn handle_delete(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let do_id = dgi.get_u32()?;
        info!("Ignoring delete of stored object {} from {}", do_id, sender);
        Ok(())
    }

    fn handle_account_query(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DbError> {
        let account_id = dgi.get_u32()?;

        let turn = self.sequencer.enter(account_id);
        self.schedule(turn, move |worker| async move {
            worker.account_query(sender, account_id).await
        });
        Ok(())
    }

    /// Feeds datagrams from the bridge until the connection is lost.
    pub async fn run(mut self, mut bridge: Bridge) -> Result<(), DbError> {
        loop {
            let batch = bridge.poll(POLL_WAIT).await?;
            for dg in &batch {
                self.handle_datagram(dg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentBackend, StoredObject};
    use shared::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TOON_SCHEMA: &str = include_str!("../../dclass/toon.json");
    const CLIENT: Channel = 1 << 33;
    const TOON_CLASS: u16 = 3;
    const ACCOUNT_CLASS: u16 = 4;

    struct Harness {
        server: DbServer,
        rx: UnboundedReceiver<Datagram>,
        schema: Arc<Schema>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::from_json(TOON_SCHEMA).unwrap());
        let backend = Arc::new(DocumentBackend::new(
            dir.path().to_path_buf(),
            schema.clone(),
            IdRange::default(),
        ));
        let (outbox, rx) = Outbox::channel();
        let mut server = DbServer::new(DbConfig::default(), schema.clone(), backend, outbox);
        server.start().await.unwrap();

        let mut harness = Harness {
            server,
            rx,
            schema,
            _dir: dir,
        };
        harness.drain();
        harness
    }

    impl Harness {
        fn drain(&mut self) -> Vec<Datagram> {
            let mut out = Vec::new();
            while let Ok(dg) = self.rx.try_recv() {
                out.push(dg);
            }
            out
        }

        async fn request(&mut self, dg: Datagram) -> Vec<Datagram> {
            self.server.handle_datagram(&dg);
            self.server.flush().await;
            self.drain()
        }

        fn add_field(&self, dg: &mut Datagram, class: &str, field: &str, value: Value) {
            let def = self.schema.field_by_name(class, field).unwrap();
            dg.add_u16(def.number);
            def.pack(dg, &[value]).unwrap();
        }

        fn number(&self, class: &str, field: &str) -> u16 {
            self.schema.field_by_name(class, field).unwrap().number
        }

        fn create_toon(&self, context: u32, account: DoId, slot: u8, with_dna: bool) -> Datagram {
            let mut dg = Datagram::server(
                &[DBSERVERS_CHANNEL],
                CLIENT,
                DBSERVER_CREATE_STORED_OBJECT,
            );
            dg.add_u32(context);
            dg.add_u16(TOON_CLASS);
            dg.add_u32(account);
            dg.add_u8(slot);
            dg.add_u16(if with_dna { 4 } else { 3 });
            self.add_field(&mut dg, "DistributedToon", "setName", "Flippy".into());
            if with_dna {
                self.add_field(
                    &mut dg,
                    "DistributedToon",
                    "setDNAString",
                    Value::Blob(vec![1, 2, 3]),
                );
            }
            self.add_field(&mut dg, "DistributedToon", "setHp", Value::Int(15));
            self.add_field(&mut dg, "DistributedToon", "WishNameState", "OPEN".into());
            dg
        }

        fn create_account(&self, context: u32) -> Datagram {
            let mut dg = Datagram::server(
                &[DBSERVERS_CHANNEL],
                CLIENT,
                DBSERVER_CREATE_STORED_OBJECT,
            );
            dg.add_u32(context);
            dg.add_u16(ACCOUNT_CLASS);
            dg.add_u16(1);
            self.add_field(
                &mut dg,
                "Account",
                "ACCOUNT_AV_SET",
                Value::Array(vec![0u32.into(); 6]),
            );
            dg
        }

        fn get(&self, context: u32, do_id: DoId, fields: &[u16]) -> Datagram {
            let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_GET_STORED_VALUES);
            dg.add_u32(context);
            dg.add_u32(do_id);
            dg.add_u16(fields.len() as u16);
            for field in fields {
                dg.add_u16(*field);
            }
            dg
        }
    }

    fn body(dg: &Datagram, expected_type: u16) -> DatagramIterator<'_> {
        let mut dgi = dg.iter();
        match dgi.read_header().unwrap() {
            DatagramHeader::Server {
                recipients,
                sender,
                msg_type,
            } => {
                assert_eq!(recipients, vec![CLIENT]);
                assert_eq!(sender, DBSERVERS_CHANNEL);
                assert_eq!(msg_type, expected_type);
            }
            other => panic!("unexpected header {:?}", other),
        }
        dgi
    }

    /// Returns (context, failed, id).
    fn create_response(dg: &Datagram) -> (u32, u8, DoId) {
        let mut dgi = body(dg, DBSERVER_CREATE_STORED_OBJECT_RESP);
        (dgi.get_u32().unwrap(), dgi.get_u8().unwrap(), dgi.get_u32().unwrap())
    }

    /// Document store whose writes to existing objects always fail.
    struct ReadOnlyAfterCreate(DocumentBackend);

    #[async_trait::async_trait]
    impl DatabaseBackend for ReadOnlyAfterCreate {
        async fn setup(&self) -> Result<(), BackendError> {
            self.0.setup().await
        }

        async fn create_object(
            &self,
            class_name: &str,
            fields: Vec<(String, Vec<u8>)>,
        ) -> Result<DoId, BackendError> {
            self.0.create_object(class_name, fields).await
        }

        async fn query_all(&self, do_id: DoId) -> Result<StoredObject, BackendError> {
            self.0.query_all(do_id).await
        }

        async fn set_fields(
            &self,
            _do_id: DoId,
            _fields: Vec<(String, Vec<u8>)>,
        ) -> Result<(), BackendError> {
            Err(BackendError::WriteFailed("read only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_slot_attach_answers_create_failed() {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::from_json(TOON_SCHEMA).unwrap());
        let store = DocumentBackend::new(
            dir.path().to_path_buf(),
            schema.clone(),
            IdRange::default(),
        );
        let backend = Arc::new(ReadOnlyAfterCreate(store));
        let (outbox, rx) = Outbox::channel();
        let mut server = DbServer::new(
            DbConfig::default(),
            schema.clone(),
            backend.clone(),
            outbox,
        );
        server.start().await.unwrap();
        let mut h = Harness {
            server,
            rx,
            schema,
            _dir: dir,
        };
        h.drain();

        let sent = h.request(h.create_account(1)).await;
        let (_, failed, account) = create_response(&sent[0]);
        assert_eq!(failed, 0);

        let sent = h.request(h.create_toon(2, account, 0, true)).await;
        assert_eq!(create_response(&sent[0]), (2, 1, 0));

        // The avatar record exists but the account never points at it.
        let orphan = account + 1;
        assert_eq!(backend.query_all(orphan).await.unwrap().class_name, "DistributedToon");
        let accounts = Accounts {
            backend: backend.as_ref(),
            schema: h.schema.as_ref(),
            account_class: "Account",
            avatar_class: "DistributedToon",
        };
        let slots = accounts.avatar_set(account).await.unwrap();
        assert!(slots.iter().all(|id| *id == 0));
    }

    #[tokio::test]
    async fn test_start_registers_database_channel() {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::from_json(TOON_SCHEMA).unwrap());
        let backend = Arc::new(DocumentBackend::new(
            dir.path().to_path_buf(),
            schema.clone(),
            IdRange::default(),
        ));
        let (outbox, mut rx) = Outbox::channel();
        let mut server = DbServer::new(DbConfig::default(), schema, backend, outbox);

        server.start().await.unwrap();

        let dg = rx.try_recv().unwrap();
        let mut dgi = dg.iter();
        assert!(matches!(
            dgi.read_header().unwrap(),
            DatagramHeader::Control { msg_type: CONTROL_SET_CHANNEL }
        ));
        assert_eq!(dgi.get_channel().unwrap(), DBSERVERS_CHANNEL);
    }

    #[tokio::test]
    async fn test_create_avatar_and_query() {
        let mut h = harness().await;

        let sent = h.request(h.create_account(1)).await;
        let (_, failed, account) = create_response(&sent[0]);
        assert_eq!(failed, 0);

        let sent = h.request(h.create_toon(2, account, 3, true)).await;
        assert_eq!(sent.len(), 1);
        let (context, failed, toon) = create_response(&sent[0]);
        assert_eq!((context, failed), (2, 0));
        assert_eq!(toon, account + 1);

        let name = h.number("DistributedToon", "setName");
        let wish = h.number("DistributedToon", "WishName");
        let sent = h.request(h.get(9, toon, &[name, wish])).await;
        let mut dgi = body(&sent[0], DBSERVER_GET_STORED_VALUES_RESP);
        assert_eq!(dgi.get_u32().unwrap(), 9);
        assert_eq!(dgi.get_u32().unwrap(), toon);
        assert_eq!(dgi.get_u8().unwrap(), STATUS_OK);
        // WishName was never set, so only one field comes back.
        assert_eq!(dgi.get_u16().unwrap(), 1);
        assert_eq!(dgi.get_u16().unwrap(), name);
        assert_eq!(dgi.get_string16().unwrap(), "Flippy");
        assert_eq!(dgi.remaining(), 0);

        // The account's avatar set now holds the toon in slot 3.
        let av_set = h.number("Account", "ACCOUNT_AV_SET");
        let sent = h.request(h.get(10, account, &[av_set])).await;
        let mut dgi = body(&sent[0], DBSERVER_GET_STORED_VALUES_RESP);
        dgi.get_u32().unwrap();
        dgi.get_u32().unwrap();
        assert_eq!(dgi.get_u8().unwrap(), STATUS_OK);
        assert_eq!(dgi.get_u16().unwrap(), 1);
        assert_eq!(dgi.get_u16().unwrap(), av_set);
        let values = h
            .schema
            .field(av_set)
            .unwrap()
            .unpack(&mut dgi)
            .unwrap();
        assert_eq!(
            values,
            vec![Value::Array(vec![
                0u32.into(),
                0u32.into(),
                0u32.into(),
                toon.into(),
                0u32.into(),
                0u32.into()
            ])]
        );
    }

    #[tokio::test]
    async fn test_create_missing_required_field_fails() {
        let mut h = harness().await;
        let sent = h.request(h.create_account(1)).await;
        let (_, _, account) = create_response(&sent[0]);

        let sent = h.request(h.create_toon(5, account, 0, false)).await;
        assert_eq!(create_response(&sent[0]), (5, 1, 0));

        let name = h.number("DistributedToon", "setName");
        let sent = h.request(h.get(6, account + 1, &[name])).await;
        let mut dgi = body(&sent[0], DBSERVER_GET_STORED_VALUES_RESP);
        dgi.get_u32().unwrap();
        assert_eq!(dgi.get_u32().unwrap(), account + 1);
        assert_eq!(dgi.get_u8().unwrap(), STATUS_NOT_FOUND);
        assert_eq!(dgi.get_u16().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_for_missing_account_fails() {
        let mut h = harness().await;

        let sent = h.request(h.create_toon(4, 123, 0, true)).await;
        assert_eq!(create_response(&sent[0]), (4, 1, 0));
    }

    #[tokio::test]
    async fn test_create_unknown_class_answers_failure() {
        let mut h = harness().await;

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_CREATE_STORED_OBJECT);
        dg.add_u32(77);
        dg.add_u16(999);
        let sent = h.request(dg).await;
        assert_eq!(create_response(&sent[0]), (77, 1, 0));
    }

    #[tokio::test]
    async fn test_set_then_get_in_one_batch() {
        let mut h = harness().await;
        let sent = h.request(h.create_account(1)).await;
        let (_, _, account) = create_response(&sent[0]);
        let sent = h.request(h.create_toon(2, account, 0, true)).await;
        let (_, _, toon) = create_response(&sent[0]);

        let mut set = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_SET_STORED_VALUES);
        set.add_u32(toon);
        set.add_u16(1);
        h.add_field(&mut set, "DistributedToon", "setHp", Value::Int(-3));
        let hp = h.number("DistributedToon", "setHp");
        let get = h.get(3, toon, &[hp]);

        h.server.handle_datagram(&set);
        h.server.handle_datagram(&get);
        h.server.flush().await;
        let sent = h.drain();
        assert_eq!(sent.len(), 2);

        let mut dgi = body(&sent[0], DBSERVER_SET_STORED_VALUES_RESP);
        assert_eq!(dgi.get_u32().unwrap(), toon);
        assert_eq!(dgi.get_u8().unwrap(), STATUS_OK);

        let mut dgi = body(&sent[1], DBSERVER_GET_STORED_VALUES_RESP);
        dgi.get_u32().unwrap();
        dgi.get_u32().unwrap();
        dgi.get_u8().unwrap();
        assert_eq!(dgi.get_u16().unwrap(), 1);
        assert_eq!(dgi.get_u16().unwrap(), hp);
        assert_eq!(dgi.get_i16().unwrap(), -3);
    }

    #[tokio::test]
    async fn test_set_statuses() {
        let mut h = harness().await;
        let sent = h.request(h.create_account(1)).await;
        let (_, _, account) = create_response(&sent[0]);

        let mut missing = Datagram::server(
            &[DBSERVERS_CHANNEL],
            CLIENT,
            DBSERVER_SET_STORED_VALUES,
        );
        missing.add_u32(account + 50);
        missing.add_u16(0);
        let sent = h.request(missing).await;
        let mut dgi = body(&sent[0], DBSERVER_SET_STORED_VALUES_RESP);
        dgi.get_u32().unwrap();
        assert_eq!(dgi.get_u8().unwrap(), STATUS_NOT_FOUND);

        // A toon field written to an account.
        let mut wrong = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_SET_STORED_VALUES);
        wrong.add_u32(account);
        wrong.add_u16(1);
        h.add_field(&mut wrong, "DistributedToon", "setHp", Value::Int(1));
        let sent = h.request(wrong).await;
        let mut dgi = body(&sent[0], DBSERVER_SET_STORED_VALUES_RESP);
        dgi.get_u32().unwrap();
        assert_eq!(dgi.get_u8().unwrap(), STATUS_WRITE_FAILED);
    }

    #[tokio::test]
    async fn test_bad_request_does_not_stop_the_next() {
        let mut h = harness().await;

        let mut bad = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_SET_STORED_VALUES);
        bad.add_u32(1);
        bad.add_u16(1);
        bad.add_u16(4242);
        h.server.handle_datagram(&bad);
        h.server.handle_datagram(&Datagram::from_bytes(vec![1, 2]));

        let sent = h.request(h.create_account(1)).await;
        assert_eq!(sent.len(), 2);
        let mut dgi = body(&sent[0], DBSERVER_SET_STORED_VALUES_RESP);
        assert_eq!(dgi.get_u32().unwrap(), 1);
        assert_eq!(dgi.get_u8().unwrap(), STATUS_FAILED);
        assert_eq!(create_response(&sent[1]).1, 0);
    }

    #[tokio::test]
    async fn test_wish_name_and_account_query() {
        let mut h = harness().await;
        let sent = h.request(h.create_account(1)).await;
        let (_, _, account) = create_response(&sent[0]);
        let sent = h.request(h.create_toon(2, account, 1, true)).await;
        let (_, _, toon) = create_response(&sent[0]);

        let mut set = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_SET_STORED_VALUES);
        set.add_u32(toon);
        set.add_u16(2);
        h.add_field(&mut set, "DistributedToon", "WishNameState", "PENDING".into());
        h.add_field(&mut set, "DistributedToon", "WishName", "Bumpy".into());
        h.request(set).await;

        let mut clear = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_WISHNAME_CLEAR);
        clear.add_u32(toon);
        clear.add_u8(1);
        assert!(h.request(clear).await.is_empty());

        let mut query = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_ACCOUNT_QUERY);
        query.add_u32(account);
        let sent = h.request(query).await;
        let mut dgi = body(&sent[0], DBSERVER_ACCOUNT_QUERY_RESP);
        // No deleted set was stored: an empty packed array.
        assert_eq!(dgi.get_blob16().unwrap(), &[][..] as &[u8]);
        assert_eq!(dgi.get_u16().unwrap(), 1);
        assert_eq!(dgi.get_u32().unwrap(), toon);
        assert_eq!(dgi.get_string16().unwrap(), "Bumpy");
        for _ in 0..3 {
            assert_eq!(dgi.get_string16().unwrap(), "");
        }
        assert_eq!(dgi.get_blob16().unwrap(), &[1, 2, 3][..]);
        assert_eq!(dgi.get_u8().unwrap(), 1);
        assert_eq!(dgi.get_u8().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_account_query_for_missing_account() {
        let mut h = harness().await;

        let mut query = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_ACCOUNT_QUERY);
        query.add_u32(31337);
        let sent = h.request(query).await;
        let mut dgi = body(&sent[0], DBSERVER_ACCOUNT_QUERY_RESP);
        assert_eq!(dgi.get_u16().unwrap(), 0);
        assert_eq!(dgi.get_u16().unwrap(), 0);
        assert_eq!(dgi.remaining(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_ignored() {
        let mut h = harness().await;

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], CLIENT, DBSERVER_DELETE_STORED_OBJECT);
        dg.add_u32(100_000_000);
        assert!(h.request(dg).await.is_empty());
        assert_eq!(h.server.in_flight(), 0);
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(&DbError::from(BackendError::NotFound(1))), STATUS_NOT_FOUND);
        assert_eq!(
            status_of(&DbError::from(BackendError::WriteFailed(String::new()))),
            STATUS_WRITE_FAILED
        );
        assert_eq!(status_of(&DbError::UnknownField(3)), STATUS_FAILED);
    }
}

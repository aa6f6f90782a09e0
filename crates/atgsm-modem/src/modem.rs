//! GsmModem -- the public handle for one GSM modem.
//!
//! A modem is a set of cooperating tasks: the IO task owns the transport,
//! the dispatcher owns device state, the operation queue runs outward
//! command sequences one at a time, and a job runner turns follow-up work
//! from the dispatcher (reads, deletes, storage cleanup) into queue
//! entries. Every public operation below is a queue entry, so two calls on
//! one modem never interleave on the wire.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atgsm_core::codec::{EncodeOptions, EncodedPdu, OutgoingSegment, SmsCodec};
use atgsm_core::driver::{Driver, DriverSet, keys};
use atgsm_core::error::{Error, Result};
use atgsm_core::events::{ModemEvent, Property, StateChange, StateFlag};
use atgsm_core::transport::Transport;
use atgsm_core::types::{
    ConcatInfo, Envelope, MessageStatus, ModemInfo, Network, NetworkEntry, SmsMode,
    StorageReport, UssdResponse,
};
use atgsm_io::io::{AtIo, Command, IoConfig, spawn_io_task};
use atgsm_io::queue::{OperationQueue, Step, sequence};

use crate::decoder::{QueryContext, StateUpdate};
use crate::dispatcher::{Control, DispatcherChannels, DispatcherConfig, Job, spawn_dispatcher};
use crate::hash::{intl_number, message_hash};
use crate::msgref::MessageReferences;
use crate::state::DeviceState;

/// Timeout of the `AT` check in [`GsmModem::detect`].
const DETECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Behaviour switches for message handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemOptions {
    /// Delete messages from storage once dispatched.
    pub delete_message_on_read: bool,
    /// Ask for delivery status reports on sent messages.
    pub request_message_status: bool,
    pub request_message_reply: bool,
    pub send_message_as_flash: bool,
    /// Delete every message in a storage the modem reports full.
    pub empty_when_full: bool,
}

impl Default for ModemOptions {
    fn default() -> Self {
        ModemOptions {
            delete_message_on_read: false,
            request_message_status: true,
            request_message_reply: false,
            send_message_as_flash: false,
            empty_when_full: false,
        }
    }
}

/// Everything needed to start a modem, assembled by the builder.
pub(crate) struct ModemConfig {
    pub name: String,
    pub driver: Driver,
    pub codec: Arc<dyn SmsCodec>,
    pub io: IoConfig,
    pub send_timeout: Duration,
    pub ussd_timeout: Duration,
    pub monitor_interval: Duration,
    pub options: ModemOptions,
    pub country_code: Option<String>,
    pub references: MessageReferences,
}

struct Inner {
    name: String,
    driver: Driver,
    codec: Arc<dyn SmsCodec>,
    io: AtIo,
    queue: OperationQueue,
    control_tx: mpsc::UnboundedSender<Control>,
    snapshot_rx: watch::Receiver<DeviceState>,
    idle_rx: watch::Receiver<bool>,
    event_tx: broadcast::Sender<ModemEvent>,
    state_tx: broadcast::Sender<StateChange>,
    info: Mutex<ModemInfo>,
    references: MessageReferences,
    send_timeout: Duration,
    ussd_timeout: Duration,
    monitor_interval: Duration,
    options: ModemOptions,
    country_code: Option<String>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// A connected GSM modem.
///
/// Constructed via [`GsmModemBuilder`](crate::builder::GsmModemBuilder).
pub struct GsmModem {
    inner: Arc<Inner>,
}

impl GsmModem {
    /// Spawn the modem tasks around `transport`.
    pub(crate) fn start(transport: Box<dyn Transport>, config: ModemConfig) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let io = spawn_io_task(transport, config.io, notify_tx);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let (state_tx, _) = broadcast::channel(64);
        let (idle_tx, idle_rx) = watch::channel(true);
        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceState::default());
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let dispatcher = spawn_dispatcher(
            DispatcherConfig {
                driver: config.driver.clone(),
                codec: Arc::clone(&config.codec),
                country_code: config.country_code.clone(),
                delete_on_read: config.options.delete_message_on_read,
                empty_when_full: config.options.empty_when_full,
            },
            DispatcherChannels {
                event_tx: event_tx.clone(),
                state_tx: state_tx.clone(),
                idle_tx,
                snapshot_tx,
                job_tx,
            },
            control_rx,
            notify_rx,
            io.subscribe_state(),
            cancel.child_token(),
        );
        let queue = OperationQueue::spawn(idle_rx.clone());

        let inner = Arc::new(Inner {
            name: config.name,
            driver: config.driver,
            codec: config.codec,
            io,
            queue,
            control_tx,
            snapshot_rx,
            idle_rx,
            event_tx,
            state_tx,
            info: Mutex::new(ModemInfo::default()),
            references: config.references,
            send_timeout: config.send_timeout,
            ussd_timeout: config.ussd_timeout,
            monitor_interval: config.monitor_interval,
            options: config.options,
            country_code: config.country_code,
            cancel,
            tasks: StdMutex::new(vec![dispatcher]),
        });

        let runner = tokio::spawn(job_runner(
            Arc::downgrade(&inner),
            job_rx,
            inner.cancel.child_token(),
        ));
        inner.add_task(runner);

        info!(name = %inner.name, driver = %inner.driver.name(), "modem started");
        GsmModem { inner }
    }

    /// Run `op` as a queue entry.
    async fn queued<T, F, Fut>(&self, label: impl Into<String>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.queue.run(label, op(Arc::clone(&self.inner))).await
    }

    // -----------------------------------------------------------------
    // Identity and lifecycle
    // -----------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The driver this modem was started with.
    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    /// Identification gathered by [`initialize`](Self::initialize).
    pub async fn info(&self) -> ModemInfo {
        self.inner.info.lock().await.clone()
    }

    /// Check the modem with `AT`, ask it to identify itself, and return the
    /// matching driver from `drivers`, or this modem's driver when none
    /// matches.
    pub async fn detect(&self, drivers: &DriverSet) -> Result<Driver> {
        let drivers = drivers.clone();
        self.queued("detect", |inner| async move {
            identify(&inner.io, &inner.driver, &drivers).await
        })
        .await
    }

    /// Run the init sequence, query device information, read the basic
    /// properties, select the default storage, and attach the polling
    /// monitors the driver needs.
    pub async fn initialize(&self) -> Result<()> {
        self.queued("initialize", |inner| async move { inner.initialize().await })
            .await?;
        self.attach_monitors();
        Ok(())
    }

    /// Stop every task and close the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.queue.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = match inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            let _ = task.await;
        }

        let mut transport = inner.io.shutdown().await?;
        transport.close().await?;
        info!(name = %inner.name, "modem disconnected");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Events and state
    // -----------------------------------------------------------------

    /// Subscribe to modem events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe to busy/idle transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the device state.
    pub fn state(&self) -> DeviceState {
        self.inner.snapshot()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle_rx.borrow()
    }

    /// Queue entries waiting or running.
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.pending()
    }

    /// Number of commands that have timed out.
    pub fn timeouts(&self) -> u32 {
        self.inner.io.timeouts()
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// Send `command` and decode the reply.
    pub async fn query(&self, command: Command) -> Result<Vec<StateUpdate>> {
        self.query_with(command, QueryContext::default()).await
    }

    /// Send `command` and decode the reply using what `context` already
    /// knows about the slot being read.
    pub async fn query_with(
        &self,
        command: Command,
        context: QueryContext,
    ) -> Result<Vec<StateUpdate>> {
        let label = format!("query {}", command.text);
        self.queued(label, |inner| async move { inner.query(command, context).await })
            .await
    }

    pub async fn charset(&self) -> Result<Option<String>> {
        self.query_key(keys::CMD_CHARSET_GET).await?;
        Ok(self.state().charset)
    }

    pub async fn charsets(&self) -> Result<Vec<String>> {
        self.query_key(keys::CMD_CHARSET_LIST).await?;
        Ok(self.state().charsets)
    }

    pub async fn set_charset(&self, charset: &str) -> Result<()> {
        let command = self.inner.command(keys::CMD_CHARSET_SET, &[("CHARSET", charset)])?;
        self.query(command).await?;
        Ok(())
    }

    pub async fn sms_mode(&self) -> Result<Option<SmsMode>> {
        self.query_key(keys::CMD_SMS_MODE_GET).await?;
        Ok(self.state().sms_mode)
    }

    /// Service centre address.
    pub async fn smsc(&self) -> Result<Option<String>> {
        self.query_key(keys::CMD_QUERY_SMSC).await?;
        Ok(self.state().smsc)
    }

    /// The registered operator.
    pub async fn network(&self) -> Result<Option<Network>> {
        self.query_key(keys::CMD_NETWORK_GET).await?;
        Ok(self.state().network)
    }

    /// Scan for operators. Scans are slow, so the send timeout applies.
    pub async fn networks(&self) -> Result<Vec<NetworkEntry>> {
        let command = self
            .inner
            .command(keys::CMD_NETWORK_LIST, &[])?
            .timeout(self.inner.send_timeout);
        self.query(command).await?;
        Ok(self.state().networks)
    }

    /// Signal strength, 0..=31 or 99 when unknown.
    pub async fn signal(&self) -> Result<Option<u8>> {
        self.query_key(keys::CMD_CSQ).await?;
        Ok(self.state().signal)
    }

    pub async fn set_keypad_lock(&self, locked: bool) -> Result<()> {
        let value = if locked { "1" } else { "0" };
        let command = self.inner.command(keys::CMD_KEYPAD_LOCK, &[("VALUE", value)])?;
        self.query(command).await?;
        Ok(())
    }

    async fn query_key(&self, key: &str) -> Result<Vec<StateUpdate>> {
        let command = self.inner.command(key, &[])?;
        self.query(command).await
    }

    // -----------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------

    /// Send `text` to `number` as one or more PDUs.
    ///
    /// Returns the message references the network assigned to each
    /// segment. A [`ModemEvent::PduSent`] is emitted either way once
    /// transmission was attempted; encoding failures return before anything
    /// is sent.
    pub async fn send_message(&self, number: &str, text: &str) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let segments = inner.codec.split(text);
        let total = u8::try_from(segments.len())
            .map_err(|_| Error::InvalidParameter(format!("message too long: {} segments", segments.len())))?;
        let reference = if total > 1 {
            Some(inner.references.next().await?)
        } else {
            None
        };
        let options = EncodeOptions {
            request_status: inner.options.request_message_status,
            request_reply: inner.options.request_message_reply,
            flash: inner.options.send_message_as_flash,
        };

        let mut pdus = Vec::with_capacity(segments.len());
        for (index, segment) in (1..=total).zip(&segments) {
            let concat = reference.map(|r| ConcatInfo {
                reference: u16::from(r),
                total,
                index,
            });
            pdus.push(inner.codec.encode(&OutgoingSegment {
                address: number,
                text: segment,
                concat,
                options,
            })?);
        }

        let smsc = inner.snapshot().smsc;
        let hash = message_hash(
            smsc.as_deref(),
            Utc::now(),
            &[
                &intl_number(number, inner.country_code.as_deref(), smsc.as_deref()),
                text,
            ],
        );
        let address = number.to_string();
        self.queued(format!("send message to {number}"), |inner| async move {
            inner.send_pdus(address, hash, pdus).await
        })
        .await
    }

    /// Select `storage` for reading and deleting. Skipped when already
    /// selected.
    pub async fn set_storage(&self, storage: &str) -> Result<()> {
        let storage = storage.to_string();
        self.queued(format!("set storage {storage}"), |inner| async move {
            inner.set_storage(&storage).await
        })
        .await
    }

    /// Query storage occupancy, selecting `storage` first when given.
    pub async fn get_storage(&self, storage: Option<&str>) -> Result<Option<StorageReport>> {
        let storage = storage.map(str::to_string);
        self.queued("get storage", |inner| async move {
            inner.get_storage(storage.as_deref()).await
        })
        .await
    }

    /// Read the message at `index` in `storage`. The message is also
    /// dispatched like any received message.
    pub async fn read_storage(&self, storage: &str, index: u32) -> Result<Option<Envelope>> {
        let storage = storage.to_string();
        self.queued(format!("read {storage}:{index}"), |inner| async move {
            inner.read_storage(&storage, index).await
        })
        .await
    }

    pub async fn delete_storage(&self, storage: &str, index: u32) -> Result<()> {
        let storage = storage.to_string();
        self.queued(format!("delete {storage}:{index}"), |inner| async move {
            inner.delete_storage(&storage, index).await
        })
        .await
    }

    /// Delete every slot of `storage`. Returns the number of slots
    /// deleted; failures on empty slots are tolerated.
    pub async fn empty_storage(&self, storage: &str) -> Result<u32> {
        let storage = storage.to_string();
        self.queued(format!("empty {storage}"), |inner| async move {
            inner.empty_storage(&storage).await
        })
        .await
    }

    /// List messages with `status` in the selected storage.
    pub async fn list_messages(&self, status: MessageStatus) -> Result<Vec<Envelope>> {
        self.queued(format!("list {status}"), |inner| async move {
            inner.list_messages(status).await
        })
        .await
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    /// Dial `number`. Emits [`ModemEvent::Dialed`].
    pub async fn dial(&self, number: &str) -> Result<()> {
        let number = number.to_string();
        self.queued(format!("dial {number}"), |inner| async move {
            inner.dial(&number).await
        })
        .await
    }

    pub async fn answer(&self) -> Result<()> {
        self.query_key(keys::CMD_ANSWER).await.map(|_| ())
    }

    pub async fn hangup(&self) -> Result<()> {
        self.query_key(keys::CMD_HANGUP).await.map(|_| ())
    }

    // -----------------------------------------------------------------
    // USSD
    // -----------------------------------------------------------------

    /// Run a USSD session. `codes` is a comma separated list of service
    /// codes sent in turn (for menu navigation); each waits for its
    /// `+CUSD` reply. Emits [`ModemEvent::UssdSession`].
    pub async fn ussd(&self, codes: &str) -> Result<Vec<UssdResponse>> {
        let codes = codes.to_string();
        self.queued(format!("ussd {codes}"), |inner| async move {
            inner.ussd(&codes).await
        })
        .await
    }

    pub async fn ussd_cancel(&self) -> Result<()> {
        self.query_key(keys::CMD_USSD_CANCEL).await.map(|_| ())
    }

    // -----------------------------------------------------------------
    // Monitors
    // -----------------------------------------------------------------

    /// Poll signal and storage when the driver has no unsolicited
    /// notification for them.
    fn attach_monitors(&self) {
        let inner = &self.inner;
        if inner.driver.get(keys::RESPONSE_RSSI).is_none() {
            debug!(name = %inner.name, "CSQ monitor enabled");
            let task = tokio::spawn(monitor(
                Arc::downgrade(inner),
                inner.monitor_interval,
                inner.cancel.child_token(),
                |inner| {
                    let command = inner.command(keys::CMD_CSQ, &[])?;
                    let this = Arc::clone(&inner);
                    inner.queue.submit("signal monitor", async move {
                        this.query(command, QueryContext::default()).await.map(|_| ())
                    })
                },
            ));
            inner.add_task(task);
        } else {
            debug!(name = %inner.name, "CSQ monitor not enabled");
        }

        if inner.driver.get(keys::RESPONSE_MEM_FULL).is_none() {
            debug!(name = %inner.name, "MEMFULL monitor enabled");
            let task = tokio::spawn(monitor(
                Arc::downgrade(inner),
                inner.monitor_interval,
                inner.cancel.child_token(),
                |inner| {
                    for key in [keys::PARAM_SMS_STORAGE, keys::PARAM_REPORT_STORAGE] {
                        if let Some(storage) = inner.driver.get(key) {
                            let this = Arc::clone(&inner);
                            inner.queue.submit("storage monitor", async move {
                                this.get_storage(Some(&storage)).await.map(|_| ())
                            })?;
                        }
                    }
                    Ok(())
                },
            ));
            inner.add_task(task);
        } else {
            debug!(name = %inner.name, "MEMFULL monitor not enabled");
        }
    }
}

// ---------------------------------------------------------------------------
// Operation bodies
// ---------------------------------------------------------------------------

impl Inner {
    fn add_task(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    fn snapshot(&self) -> DeviceState {
        self.snapshot_rx.borrow().clone()
    }

    /// Resolve a driver command. An empty template means the modem does
    /// not support it.
    fn command(&self, key: &str, vars: &[(&str, &str)]) -> Result<Command> {
        self.driver
            .get_with(key, vars)
            .map(Command::new)
            .ok_or_else(|| Error::Unsupported(format!("{key} not supported by {}", self.driver.name())))
    }

    fn control(&self, control: Control) -> Result<()> {
        self.control_tx.send(control).map_err(|_| Error::NotConnected)
    }

    fn emit(&self, event: ModemEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_flag(&self, flag: StateFlag, on: bool) -> Result<()> {
        self.control(Control::SetFlag { flag, on })
    }

    /// Hand response lines to the dispatcher and wait for the decoded
    /// updates.
    async fn process(&self, lines: Vec<String>, context: QueryContext) -> Result<Vec<StateUpdate>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        let (reply, rx) = oneshot::channel();
        self.control(Control::Process {
            lines,
            context,
            reply,
        })?;
        rx.await.map_err(|_| Error::NotConnected)
    }

    async fn query(&self, command: Command, context: QueryContext) -> Result<Vec<StateUpdate>> {
        match self.io.send(command).await {
            Ok(response) => self.process(response.lines, context).await,
            Err(Error::CommandFailed { command, response }) => {
                // A structured error code in the reply is still a property.
                self.process(response.clone(), context).await?;
                Err(Error::CommandFailed { command, response })
            }
            Err(e) => Err(e),
        }
    }

    async fn initialize(&self) -> Result<()> {
        let init: Vec<(String, Command)> = std::iter::once(keys::CMD_INIT.to_string())
            .chain((1..=9).map(|i| format!("{}{i}", keys::CMD_INIT)))
            .filter_map(|key| self.driver.get(&key).map(|c| (key, Command::new(c))))
            .collect();
        self.io.batch(init).await;

        const INFO_QUERIES: [&str; 10] = [
            keys::CMD_QUERY_FRIENDLY_NAME,
            keys::CMD_QUERY_MANUFACTURER,
            keys::CMD_QUERY_MODEL,
            keys::CMD_QUERY_VERSION,
            keys::CMD_QUERY_IMEI,
            keys::CMD_QUERY_IMSI,
            keys::CMD_CALL_MONITOR,
            keys::CMD_SMS_MONITOR,
            keys::CMD_USSD_SET,
            keys::CMD_CHARSET_LIST,
        ];
        let queries: Vec<(String, Command)> = INFO_QUERIES
            .iter()
            .filter_map(|key| self.driver.get(key).map(|c| (key.to_string(), Command::new(c))))
            .collect();
        let responses = self.io.batch(queries).await;

        let text = |key: &str| {
            responses
                .response(key)
                .map(|r| r.text().trim().to_string())
                .filter(|t| !t.is_empty())
        };
        let info = ModemInfo {
            friendly_name: text(keys::CMD_QUERY_FRIENDLY_NAME),
            manufacturer: text(keys::CMD_QUERY_MANUFACTURER),
            model: text(keys::CMD_QUERY_MODEL),
            version: text(keys::CMD_QUERY_VERSION),
            serial: text(keys::CMD_QUERY_IMEI),
            imsi: text(keys::CMD_QUERY_IMSI),
            has_call: responses.ok(keys::CMD_CALL_MONITOR),
            has_sms: responses.ok(keys::CMD_SMS_MONITOR),
            has_ussd: responses.ok(keys::CMD_USSD_SET),
        };
        if let Some(charsets) = responses.response(keys::CMD_CHARSET_LIST) {
            self.process(charsets.lines.clone(), QueryContext::default())
                .await?;
        }
        info!(
            name = %self.name,
            manufacturer = ?info.manufacturer,
            model = ?info.model,
            call = info.has_call,
            sms = info.has_sms,
            ussd = info.has_ussd,
            "modem identified"
        );
        *self.info.lock().await = info;

        for key in [
            keys::CMD_CHARSET_GET,
            keys::CMD_SMS_MODE_GET,
            keys::CMD_QUERY_SMSC,
            keys::CMD_NETWORK_GET,
        ] {
            let Ok(command) = self.command(key, &[]) else {
                continue;
            };
            tolerate(key, self.query(command, QueryContext::default()).await)?;
        }

        let default_storage = self.driver.get(keys::PARAM_SMS_STORAGE);
        tolerate(
            keys::PARAM_SMS_STORAGE,
            self.get_storage(default_storage.as_deref()).await,
        )?;
        Ok(())
    }

    async fn set_storage(&self, storage: &str) -> Result<()> {
        if self.snapshot().storage.as_deref() == Some(storage) {
            debug!(storage, "storage already selected");
            return Ok(());
        }
        let command = self.command(keys::CMD_SMS_STORAGE_SET, &[("STORAGE", storage)])?;
        self.query(
            command,
            QueryContext {
                storage: Some(storage.to_string()),
                index: None,
            },
        )
        .await?;

        let (reply, rx) = oneshot::channel();
        self.control(Control::SelectStorage {
            storage: storage.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::NotConnected)
    }

    async fn get_storage(&self, storage: Option<&str>) -> Result<Option<StorageReport>> {
        if let Some(storage) = storage {
            self.set_storage(storage).await?;
        }
        let command = self.command(keys::CMD_SMS_STORAGE_GET, &[])?;
        let updates = self.query(command, QueryContext::default()).await?;
        Ok(updates.into_iter().find_map(|u| match u {
            StateUpdate::Property(Property::Storage(report)) => Some(report),
            _ => None,
        }))
    }

    async fn read_storage(&self, storage: &str, index: u32) -> Result<Option<Envelope>> {
        self.set_storage(storage).await?;
        let id = index.to_string();
        let command = self.command(keys::CMD_SMS_READ, &[("SMS_ID", &id)])?;
        let updates = self
            .query(command, QueryContext::slot(storage, index))
            .await?;
        Ok(envelopes(updates).into_iter().next())
    }

    async fn delete_storage(&self, storage: &str, index: u32) -> Result<()> {
        self.set_storage(storage).await?;
        let id = index.to_string();
        let command = self.command(keys::CMD_SMS_DELETE, &[("SMS_ID", &id)])?;
        self.query(command, QueryContext::slot(storage, index))
            .await
            .map(|_| ())
    }

    async fn empty_storage(&self, storage: &str) -> Result<u32> {
        self.get_storage(Some(storage)).await?;
        let total = self
            .snapshot()
            .storage_info(storage)
            .map(|s| s.total)
            .unwrap_or_default();

        let mut deleted = 0;
        for index in 1..=total {
            match self.delete_storage(storage, index).await {
                Ok(()) => deleted += 1,
                Err(e) => debug!(storage, index, error = %e, "slot not deleted"),
            }
        }
        info!(storage, deleted, total, "storage emptied");
        Ok(deleted)
    }

    async fn list_messages(&self, status: MessageStatus) -> Result<Vec<Envelope>> {
        let stat = status.code().to_string();
        let command = self.command(keys::CMD_SMS_LIST, &[("SMS_STAT", &stat)])?;
        let updates = self.query(command, QueryContext::default()).await?;
        Ok(envelopes(updates))
    }

    /// Select the report storage and list read reports; their slots are
    /// deleted once the reports are dispatched.
    async fn clean_reports(&self, storage: &str) -> Result<()> {
        self.set_storage(storage).await?;
        self.list_messages(MessageStatus::ReceivedRead).await?;
        Ok(())
    }

    async fn send_pdus(
        self: Arc<Self>,
        address: String,
        hash: String,
        pdus: Vec<EncodedPdu>,
    ) -> Result<Vec<u8>> {
        self.set_flag(StateFlag::Sending, true)?;
        let result = self.transmit(&pdus).await;
        let _ = self.set_flag(StateFlag::Sending, false);

        let (success, references) = match &result {
            Ok(references) => (true, references.clone()),
            Err(e) => {
                warn!(address = %address, error = %e, "message not sent");
                (false, Vec::new())
            }
        };
        self.emit(ModemEvent::PduSent {
            success,
            address,
            hash,
            references,
        });
        result
    }

    /// Switch to PDU mode and submit every segment. The first rejected
    /// step ends the send.
    async fn transmit(self: &Arc<Self>, pdus: &[EncodedPdu]) -> Result<Vec<u8>> {
        let mode = SmsMode::Pdu.code().to_string();
        let mut steps = vec![self.step(self.command(keys::CMD_SMS_MODE_SET, &[("SMS_MODE", &mode)])?)];

        let wait_prompt = self.driver.flag(keys::PARAM_SMS_WAIT_PROMPT);
        let prompt = self
            .driver
            .get(keys::RESPONSE_SMS_PROMPT)
            .unwrap_or_else(|| "> ".to_string());
        let commit = self.driver.get(keys::PARAM_SMS_COMMIT).unwrap_or_default();

        for pdu in pdus {
            let len = pdu.tp_length.to_string();
            let vars = [
                ("SMS_LEN", len.as_str()),
                ("MESSAGE", pdu.pdu.as_str()),
                ("COMMIT", commit.as_str()),
            ];
            if wait_prompt {
                let send = self.command(keys::CMD_SMS_SEND_PDU, &vars)?.expect(prompt.as_str());
                let body = self
                    .command(keys::CMD_SMS_SEND_COMMIT, &vars)?
                    .timeout(self.send_timeout);
                steps.push(self.step(send));
                steps.push(self.step(body));
            } else {
                let send = self
                    .command(keys::CMD_SMS_SEND_PDU, &vars)?
                    .ignore(prompt.as_str())
                    .timeout(self.send_timeout);
                steps.push(self.step(send));
            }
        }

        let updates = sequence(steps).await?;
        Ok(updates
            .into_iter()
            .flatten()
            .filter_map(|u| match u {
                StateUpdate::Property(Property::MessageReference(r)) => Some(r),
                _ => None,
            })
            .collect())
    }

    fn step(self: &Arc<Self>, command: Command) -> Step<Vec<StateUpdate>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.query(command, QueryContext::default()).await })
    }

    async fn dial(&self, number: &str) -> Result<()> {
        let smsc = self.snapshot().smsc;
        let hash = message_hash(
            smsc.as_deref(),
            Utc::now(),
            &[&intl_number(number, self.country_code.as_deref(), smsc.as_deref())],
        );
        let command = self.command(keys::CMD_DIAL, &[("PHONE_NUMBER", number)])?;
        let result = self
            .query(command, QueryContext::default())
            .await
            .map(|_| ());
        self.emit(ModemEvent::Dialed {
            success: result.is_ok(),
            address: number.to_string(),
            hash,
        });
        result
    }

    async fn ussd(&self, codes: &str) -> Result<Vec<UssdResponse>> {
        let smsc = self.snapshot().smsc;
        let hash = message_hash(smsc.as_deref(), Utc::now(), &[codes]);
        let result = self.ussd_session(codes).await;
        self.emit(ModemEvent::UssdSession {
            success: result.is_ok(),
            code: codes.to_string(),
            hash,
        });
        result
    }

    async fn ussd_session(&self, codes: &str) -> Result<Vec<UssdResponse>> {
        let dcs = self.driver.number(keys::PARAM_USSD_ENCODING).unwrap_or(15);
        let dcs = u8::try_from(dcs)
            .map_err(|_| Error::InvalidParameter(format!("USSD encoding {dcs} out of range")))?;
        let encoded = self.driver.flag(keys::PARAM_USSD_ENCODED);
        let enc = dcs.to_string();

        let mut responses = Vec::new();
        for code in codes.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let service = if encoded {
                self.codec.encode_ussd(dcs, code)?
            } else {
                code.to_string()
            };
            let command = self.command(
                keys::CMD_USSD_SEND,
                &[("SERVICE_NUMBER", service.as_str()), ("ENC", enc.as_str())],
            )?;

            // The reply may arrive inside the command response or later as
            // a notification; the waiter catches both.
            let (reply, rx) = oneshot::channel();
            self.control(Control::WaitUssd { reply })?;
            self.query(command, QueryContext::default()).await?;

            match tokio::time::timeout(self.ussd_timeout, rx).await {
                Ok(Ok(response)) => {
                    debug!(code, reply = ?response.message, "USSD reply");
                    responses.push(response);
                }
                Ok(Err(_)) => return Err(Error::NotConnected),
                Err(_) => {
                    return Err(Error::CommandTimeout {
                        command: format!("USSD {code}"),
                    });
                }
            }
        }
        Ok(responses)
    }

    /// Queue follow-up work from the dispatcher.
    fn schedule(self: Arc<Self>, job: Job) -> Result<()> {
        let this = Arc::clone(&self);
        match job {
            Job::Read { storage, index } => self.queue.submit(
                format!("read {storage}:{index}"),
                async move { this.read_storage(&storage, index).await.map(|_| ()) },
            ),
            Job::Delete { storage, index } => self.queue.submit(
                format!("delete {storage}:{index}"),
                async move { this.delete_storage(&storage, index).await },
            ),
            Job::EmptyStorage(storage) => self.queue.submit(
                format!("empty {storage}"),
                async move { this.empty_storage(&storage).await.map(|_| ()) },
            ),
            Job::CleanReports(storage) => self.queue.submit(
                format!("clean reports {storage}"),
                async move { this.clean_reports(&storage).await },
            ),
            Job::Finish(cleanup) => self.queue.submit(
                format!("{cleanup:?} cleanup done"),
                async move { this.control(Control::CleanupDone(cleanup)) },
            ),
        }
    }
}

fn envelopes(updates: Vec<StateUpdate>) -> Vec<Envelope> {
    updates
        .into_iter()
        .flat_map(|u| match u {
            StateUpdate::Messages(envelopes) => envelopes,
            _ => Vec::new(),
        })
        .collect()
}

/// Keep going when one step of a longer sequence fails, unless the link
/// itself is gone.
fn tolerate<T>(step: &str, result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e @ (Error::NotConnected | Error::ConnectionLost | Error::Transport(_) | Error::Io(_))) => {
            Err(e)
        }
        Err(e) => {
            warn!(step, error = %e, "initialization step failed");
            Ok(())
        }
    }
}

/// Check with `AT` and identify the modem with `ATI`.
pub(crate) async fn identify(io: &AtIo, current: &Driver, drivers: &DriverSet) -> Result<Driver> {
    io.send(Command::new("AT").timeout(DETECT_TIMEOUT)).await?;
    let query = current
        .get(keys::CMD_QUERY_FRIENDLY_NAME)
        .unwrap_or_else(|| "ATI".to_string());
    let response = io.send(Command::new(query)).await?;
    let identification = response.lines.join("\n");

    match drivers.find_match(&identification) {
        Some(driver) => {
            info!(driver = %driver.name(), "modem driver detected");
            Ok(driver.clone())
        }
        None => {
            debug!(identification = %identification, driver = %current.name(), "no matching driver, keeping current");
            Ok(current.clone())
        }
    }
}

async fn job_runner(
    inner: Weak<Inner>,
    mut job_rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.schedule(job) {
            debug!(error = %e, "follow-up not queued");
        }
    }
    debug!("job runner stopped");
}

/// Run `tick` every `period` until cancelled or the modem is gone.
async fn monitor<F>(inner: Weak<Inner>, period: Duration, cancel: CancellationToken, tick: F)
where
    F: Fn(Arc<Inner>) -> Result<()> + Send + 'static,
{
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = tick(inner) {
            debug!(error = %e, "monitor tick not queued");
        }
    }
}

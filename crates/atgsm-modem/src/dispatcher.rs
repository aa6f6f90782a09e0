//! The dispatcher task: sole owner of device state.
//!
//! Notification lines from the IO task and response lines handed over by
//! modem operations are decoded here, applied to [`DeviceState`], and
//! announced on the event channel. The dispatcher also owns the state
//! flags, derives the idle signal that gates the operation queue, and runs
//! the storage maintenance rules on each idle transition. Follow-up work
//! (reads, deletes, cleanup) leaves as [`Job`]s so the dispatcher never
//! waits on the queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atgsm_core::codec::SmsCodec;
use atgsm_core::driver::{Driver, keys};
use atgsm_core::events::{ModemEvent, StateChange, StateFlag};
use atgsm_core::types::{Envelope, UssdResponse};
use atgsm_io::io::EngineState;
use atgsm_io::matcher::Markers;
use atgsm_io::processor::{Processor, Recovery};

use crate::decoder::{GsmDecoder, QueryContext, StateUpdate};
use crate::reassembly::{HashContext, Reassembler};
use crate::signatures::{SignatureKind, build_processor};
use crate::state::{Action, DeviceState};

/// Requests to the dispatcher.
pub(crate) enum Control {
    /// Decode response lines of a command.
    Process {
        lines: Vec<String>,
        context: QueryContext,
        reply: oneshot::Sender<Vec<StateUpdate>>,
    },
    /// Record a storage selection that the reply does not name.
    SelectStorage {
        storage: String,
        reply: oneshot::Sender<()>,
    },
    SetFlag { flag: StateFlag, on: bool },
    /// Deliver the next USSD response to `reply` instead of the event
    /// channel.
    WaitUssd { reply: oneshot::Sender<UssdResponse> },
    /// The queued work of a cleanup has run.
    CleanupDone(Cleanup),
}

/// Kinds of storage maintenance. At most one of each is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cleanup {
    /// Full storages.
    Storage,
    /// Delivered status reports.
    Reports,
}

/// Follow-up work for the operation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Job {
    Read { storage: String, index: u32 },
    Delete { storage: String, index: u32 },
    EmptyStorage(String),
    /// List read messages in the report storage so their slots get deleted.
    CleanReports(String),
    /// Report back once the cleanup jobs queued before this one have run.
    Finish(Cleanup),
}

/// Fixed inputs of a dispatcher.
pub(crate) struct DispatcherConfig {
    pub driver: Driver,
    pub codec: Arc<dyn SmsCodec>,
    pub country_code: Option<String>,
    pub delete_on_read: bool,
    pub empty_when_full: bool,
}

/// Channels the dispatcher publishes on.
pub(crate) struct DispatcherChannels {
    pub event_tx: broadcast::Sender<ModemEvent>,
    pub state_tx: broadcast::Sender<StateChange>,
    pub idle_tx: watch::Sender<bool>,
    pub snapshot_tx: watch::Sender<DeviceState>,
    pub job_tx: mpsc::UnboundedSender<Job>,
}

struct Dispatcher {
    processor: Processor<SignatureKind>,
    recovery: Recovery,
    markers: Markers,
    driver: Driver,
    codec: Arc<dyn SmsCodec>,
    country_code: Option<String>,
    delete_on_read: bool,
    empty_when_full: bool,
    state: DeviceState,
    reassembler: Reassembler,
    flags: BTreeSet<StateFlag>,
    idle: bool,
    storage_cleaning: bool,
    report_cleaning: bool,
    ussd_waiter: Option<oneshot::Sender<UssdResponse>>,
    channels: DispatcherChannels,
}

/// Spawn the dispatcher task.
pub(crate) fn spawn_dispatcher(
    config: DispatcherConfig,
    channels: DispatcherChannels,
    control_rx: mpsc::UnboundedReceiver<Control>,
    notify_rx: mpsc::UnboundedReceiver<Vec<String>>,
    engine_rx: watch::Receiver<EngineState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let dispatcher = Dispatcher::new(config, channels);
    tokio::spawn(dispatcher.run(control_rx, notify_rx, engine_rx, cancel))
}

impl Dispatcher {
    fn new(config: DispatcherConfig, channels: DispatcherChannels) -> Self {
        let report_storage = config.driver.get(keys::PARAM_REPORT_STORAGE);
        Dispatcher {
            processor: build_processor(&config.driver),
            recovery: Recovery::new(),
            markers: Markers::from_driver(&config.driver),
            driver: config.driver,
            codec: config.codec,
            country_code: config.country_code,
            delete_on_read: config.delete_on_read,
            empty_when_full: config.empty_when_full,
            state: DeviceState::new(report_storage),
            reassembler: Reassembler::new(),
            flags: BTreeSet::new(),
            idle: true,
            storage_cleaning: false,
            report_cleaning: false,
            ussd_waiter: None,
            channels,
        }
    }

    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut notify_rx: mpsc::UnboundedReceiver<Vec<String>>,
        mut engine_rx: watch::Receiver<EngineState>,
        cancel: CancellationToken,
    ) {
        let mut engine_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("dispatcher cancelled");
                    break;
                }

                ctrl = control_rx.recv() => match ctrl {
                    Some(ctrl) => self.handle_control(ctrl),
                    None => {
                        debug!("control channel closed, exiting dispatcher");
                        break;
                    }
                },

                lines = notify_rx.recv() => match lines {
                    Some(lines) => {
                        self.process(lines, &QueryContext::default(), true);
                    }
                    None => {
                        debug!("notification channel closed, exiting dispatcher");
                        break;
                    }
                },

                changed = engine_rx.changed(), if engine_open => match changed {
                    Ok(()) => {
                        let busy = !engine_rx.borrow_and_update().is_idle();
                        self.set_flag(StateFlag::Busy, busy);
                    }
                    Err(_) => engine_open = false,
                },
            }
        }
    }

    fn handle_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Process {
                lines,
                context,
                reply,
            } => {
                let updates = self.process(lines, &context, false);
                let _ = reply.send(updates);
            }
            Control::SelectStorage { storage, reply } => {
                self.state.select_storage(&storage);
                self.publish_snapshot();
                let _ = reply.send(());
            }
            Control::SetFlag { flag, on } => self.set_flag(flag, on),
            Control::WaitUssd { reply } => self.ussd_waiter = Some(reply),
            Control::CleanupDone(cleanup) => self.cleanup_done(cleanup),
        }
    }

    /// Decode `lines` and apply the result. Lines nothing matched go to the
    /// recovery backlog when `recover` is set.
    fn process(
        &mut self,
        lines: Vec<String>,
        context: &QueryContext,
        recover: bool,
    ) -> Vec<StateUpdate> {
        if lines.is_empty() {
            return Vec::new();
        }
        self.set_flag(StateFlag::Processing, true);

        let storage = self.state.storage.clone();
        let decoder = GsmDecoder {
            codec: self.codec.as_ref(),
            driver: &self.driver,
            storage: storage.as_deref(),
            context,
        };
        let result = self.processor.process(lines, &decoder);
        let mut updates = result.updates;
        if recover && !result.unprocessed.is_empty() {
            if let Some(resolved) = self.recovery.resolve(
                &self.processor,
                &decoder,
                &self.markers,
                result.unprocessed,
            ) {
                updates.extend(resolved.updates);
            }
        }

        for update in &updates {
            self.apply(update.clone());
        }
        self.publish_snapshot();

        self.set_flag(StateFlag::Processing, false);
        updates
    }

    fn apply(&mut self, update: StateUpdate) {
        for action in self.state.apply(update) {
            match action {
                Action::Event(event) => self.emit(event),
                Action::Messages(envelopes) => self.dispatch_messages(envelopes),
                Action::Read { storage, index } => self.job(Job::Read { storage, index }),
                Action::Ussd(response) => match self.ussd_waiter.take() {
                    Some(waiter) if !waiter.is_closed() => {
                        debug!(code = %response.code, "USSD response delivered to session");
                        let _ = waiter.send(response);
                    }
                    _ => self.emit(ModemEvent::Ussd(response)),
                },
            }
        }
    }

    fn dispatch_messages(&mut self, envelopes: Vec<Envelope>) {
        self.reassembler.push(envelopes);
        let ctx = HashContext {
            smsc: self.state.smsc.as_deref(),
            country_code: self.country_code.as_deref(),
        };
        let dispatch = self.reassembler.dispatch(&ctx, self.delete_on_read);
        for event in dispatch.events {
            self.emit(event);
        }
        for (storage, index) in dispatch.delete {
            self.job(Job::Delete { storage, index });
        }
    }

    fn set_flag(&mut self, flag: StateFlag, on: bool) {
        let changed = if on {
            self.flags.insert(flag)
        } else {
            self.flags.remove(&flag)
        };
        if !changed {
            return;
        }

        let idle = self.flags.is_empty();
        if idle == self.idle {
            return;
        }
        self.idle = idle;
        self.channels.idle_tx.send_replace(idle);
        let _ = self.channels.state_tx.send(StateChange {
            idle,
            active: self.flags.iter().copied().collect(),
        });
        if idle {
            self.on_idle();
        }
    }

    /// Storage maintenance, run on each idle transition. A cleanup stays
    /// in flight until its [`Job::Finish`] comes back, so full readings
    /// taken while it runs do not schedule it again.
    fn on_idle(&mut self) {
        if !self.state.memfull.is_empty() && !self.storage_cleaning {
            self.storage_cleaning = true;
            for storage in self.state.memfull.clone() {
                if self.state.report_storage.as_deref() == Some(storage.as_str()) {
                    self.job(Job::CleanReports(storage));
                } else if self.empty_when_full {
                    self.job(Job::EmptyStorage(storage));
                } else {
                    warn!(storage = %storage, "message storage full, enable empty-when-full to clean it");
                }
            }
            self.job(Job::Finish(Cleanup::Storage));
        } else if self.state.has_report && !self.report_cleaning {
            if let Some(storage) = self.state.report_storage.clone() {
                self.report_cleaning = true;
                self.job(Job::CleanReports(storage));
                self.job(Job::Finish(Cleanup::Reports));
            }
        }
    }

    fn cleanup_done(&mut self, cleanup: Cleanup) {
        debug!(cleanup = ?cleanup, "cleanup finished");
        match cleanup {
            Cleanup::Storage => {
                self.storage_cleaning = false;
                self.state.memfull.clear();
            }
            Cleanup::Reports => {
                self.report_cleaning = false;
                self.state.has_report = false;
            }
        }
        self.publish_snapshot();
    }

    fn emit(&self, event: ModemEvent) {
        let _ = self.channels.event_tx.send(event);
    }

    fn job(&self, job: Job) {
        debug!(job = ?job, "scheduling follow-up");
        if self.channels.job_tx.send(job).is_err() {
            debug!("job runner gone, follow-up dropped");
        }
    }

    fn publish_snapshot(&self) {
        self.channels.snapshot_tx.send_replace(self.state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atgsm_core::events::Property;
    use atgsm_core::types::{ConcatInfo, SmsMessage};
    use atgsm_test_harness::MockCodec;
    use chrono::DateTime;
    use std::time::Duration;

    struct Harness {
        control_tx: mpsc::UnboundedSender<Control>,
        notify_tx: mpsc::UnboundedSender<Vec<String>>,
        engine_tx: watch::Sender<EngineState>,
        events: broadcast::Receiver<ModemEvent>,
        states: broadcast::Receiver<StateChange>,
        idle_rx: watch::Receiver<bool>,
        snapshot_rx: watch::Receiver<DeviceState>,
        jobs: mpsc::UnboundedReceiver<Job>,
        cancel: CancellationToken,
    }

    fn spawn_with(driver: Driver, delete_on_read: bool, empty_when_full: bool) -> Harness {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = watch::channel(EngineState::Idle);
        let (event_tx, events) = broadcast::channel(64);
        let (state_tx, states) = broadcast::channel(64);
        let (idle_tx, idle_rx) = watch::channel(true);
        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceState::default());
        let (job_tx, jobs) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        spawn_dispatcher(
            DispatcherConfig {
                driver,
                codec: Arc::new(MockCodec::new()),
                country_code: Some("62".into()),
                delete_on_read,
                empty_when_full,
            },
            DispatcherChannels {
                event_tx,
                state_tx,
                idle_tx,
                snapshot_tx,
                job_tx,
            },
            control_rx,
            notify_rx,
            engine_rx,
            cancel.clone(),
        );

        Harness {
            control_tx,
            notify_tx,
            engine_tx,
            events,
            states,
            idle_rx,
            snapshot_rx,
            jobs,
            cancel,
        }
    }

    fn spawn() -> Harness {
        spawn_with(Driver::generic(), false, false)
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    async fn process(h: &Harness, raw: &[&str], context: QueryContext) -> Vec<StateUpdate> {
        let (reply, rx) = oneshot::channel();
        h.control_tx
            .send(Control::Process {
                lines: lines(raw),
                context,
                reply,
            })
            .unwrap();
        rx.await.unwrap()
    }

    async fn next_event(h: &mut Harness) -> ModemEvent {
        tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .expect("no event")
            .unwrap()
    }

    async fn next_job(h: &mut Harness) -> Job {
        tokio::time::timeout(Duration::from_secs(1), h.jobs.recv())
            .await
            .expect("no job")
            .unwrap()
    }

    fn part(index: u8, text: &str) -> String {
        let (pdu, len) = MockCodec::message_pdu(&SmsMessage {
            address: "081234567890".into(),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            text: text.into(),
            concat: Some(ConcatInfo {
                reference: 4,
                total: 2,
                index,
            }),
            hash: None,
        });
        format!("+CMT: ,{len}\n{pdu}")
    }

    // =======================================================================
    // Notifications
    // =======================================================================

    #[tokio::test]
    async fn notification_emits_property() {
        let mut h = spawn();
        h.notify_tx.send(lines(&["+CSQ: 21,99"])).unwrap();
        assert_eq!(
            next_event(&mut h).await,
            ModemEvent::PropertyChanged(Property::Signal(21))
        );
        h.snapshot_rx.changed().await.unwrap();
        assert_eq!(h.snapshot_rx.borrow().signal, Some(21));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn stored_message_notification_schedules_read() {
        let mut h = spawn();
        h.notify_tx.send(lines(&["+CMTI: \"SM\",3"])).unwrap();
        assert_eq!(
            next_job(&mut h).await,
            Job::Read {
                storage: "SM".into(),
                index: 3
            }
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn split_notification_recovered_across_batches() {
        let mut h = spawn();
        h.notify_tx.send(lines(&["+CMTI: \"S"])).unwrap();
        h.notify_tx.send(lines(&["M\",9"])).unwrap();
        assert_eq!(
            next_job(&mut h).await,
            Job::Read {
                storage: "SM".into(),
                index: 9
            }
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn multipart_parts_join_across_notifications() {
        let mut h = spawn();
        let second = part(2, "world");
        let first = part(1, "hello ");
        let second: Vec<&str> = second.split('\n').collect();
        let first: Vec<&str> = first.split('\n').collect();

        h.notify_tx.send(lines(&second)).unwrap();
        h.notify_tx.send(lines(&first)).unwrap();
        match next_event(&mut h).await {
            ModemEvent::MultipartMessage(m) => {
                assert_eq!(m.text, "hello world");
                assert_eq!(m.parts.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn ring_with_caller_emitted() {
        let mut h = spawn();
        h.notify_tx
            .send(lines(&["RING", "+CLIP: \"+6281357909840\",145"]))
            .unwrap();
        assert_eq!(
            next_event(&mut h).await,
            ModemEvent::Ring {
                caller: "+6281357909840".into()
            }
        );
        h.cancel.cancel();
    }

    // =======================================================================
    // Responses
    // =======================================================================

    #[tokio::test]
    async fn response_context_sets_read_slot() {
        let mut h = spawn_with(Driver::generic(), true, false);
        let (pdu, len) = MockCodec::message_pdu(&SmsMessage {
            address: "+6281234567890".into(),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            text: "stored".into(),
            concat: None,
            hash: None,
        });
        let header = format!("+CMGR: 1,,{len}");
        let updates = process(&h, &[header.as_str(), pdu.as_str()], QueryContext::slot("ME", 5)).await;
        assert_eq!(updates.len(), 1);
        assert!(matches!(next_event(&mut h).await, ModemEvent::Message(m) if m.text == "stored"));
        assert_eq!(
            next_job(&mut h).await,
            Job::Delete {
                storage: "ME".into(),
                index: 5
            }
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn ussd_goes_to_waiter_then_event_channel() {
        let mut h = spawn();
        let (reply, rx) = oneshot::channel();
        h.control_tx.send(Control::WaitUssd { reply }).unwrap();
        h.notify_tx.send(lines(&["+CUSD: 0,\"Saldo 100\",15"])).unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.message.as_deref(), Some("Saldo 100"));

        h.notify_tx.send(lines(&["+CUSD: 2"])).unwrap();
        assert!(matches!(next_event(&mut h).await, ModemEvent::Ussd(r) if r.code == "2"));
        h.cancel.cancel();
    }

    // =======================================================================
    // Flags and maintenance
    // =======================================================================

    #[tokio::test]
    async fn engine_busy_drives_idle_signal() {
        let mut h = spawn();
        h.engine_tx.send_replace(EngineState::AwaitingResponse);
        let change = tokio::time::timeout(Duration::from_secs(1), h.states.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            StateChange {
                idle: false,
                active: vec![StateFlag::Busy]
            }
        );
        assert!(!*h.idle_rx.borrow());

        h.engine_tx.send_replace(EngineState::Idle);
        h.idle_rx.wait_for(|idle| *idle).await.unwrap();
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn full_storage_emptied_on_idle() {
        let mut h = spawn_with(Driver::generic(), false, true);
        h.notify_tx
            .send(lines(&["+CPMS: \"SM\",40,40,\"SM\",40,40"]))
            .unwrap();
        assert_eq!(next_job(&mut h).await, Job::EmptyStorage("SM".into()));
        assert_eq!(next_job(&mut h).await, Job::Finish(Cleanup::Storage));
        assert_eq!(h.snapshot_rx.borrow().memfull, vec!["SM".to_string()]);

        h.control_tx
            .send(Control::CleanupDone(Cleanup::Storage))
            .unwrap();
        h.snapshot_rx
            .wait_for(|s| s.memfull.is_empty() && s.storage.as_deref() == Some("SM"))
            .await
            .unwrap();
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn full_storage_not_rescheduled_while_cleaning() {
        let mut h = spawn_with(Driver::generic(), false, true);
        let full = ["+CPMS: \"SM\",40,40,\"SM\",40,40"];
        h.notify_tx.send(lines(&full)).unwrap();
        assert_eq!(next_job(&mut h).await, Job::EmptyStorage("SM".into()));
        assert_eq!(next_job(&mut h).await, Job::Finish(Cleanup::Storage));

        // The cleanup re-reads the storage before deleting; still full.
        process(&h, &full, QueryContext::default()).await;
        assert!(h.jobs.try_recv().is_err());

        h.control_tx
            .send(Control::CleanupDone(Cleanup::Storage))
            .unwrap();
        process(&h, &full, QueryContext::default()).await;
        assert_eq!(next_job(&mut h).await, Job::EmptyStorage("SM".into()));
        assert_eq!(next_job(&mut h).await, Job::Finish(Cleanup::Storage));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn pending_reports_cleaned_on_idle() {
        let driver = Driver::derive("Reports", &Driver::generic())
            .with(keys::PARAM_REPORT_STORAGE, "SR");
        let mut h = spawn_with(driver, false, false);
        let reading = ["+CPMS: \"SM\",1,40,\"SR\",2,20"];
        h.notify_tx.send(lines(&reading)).unwrap();
        assert_eq!(next_job(&mut h).await, Job::CleanReports("SR".into()));
        assert_eq!(next_job(&mut h).await, Job::Finish(Cleanup::Reports));

        process(&h, &reading, QueryContext::default()).await;
        assert!(h.jobs.try_recv().is_err());
        assert!(h.snapshot_rx.borrow().has_report);

        h.control_tx
            .send(Control::CleanupDone(Cleanup::Reports))
            .unwrap();
        h.snapshot_rx.wait_for(|s| !s.has_report).await.unwrap();
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn sending_flag_reported_on_state_channel() {
        let mut h = spawn();
        h.control_tx
            .send(Control::SetFlag {
                flag: StateFlag::Sending,
                on: true,
            })
            .unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), h.states.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!change.idle);
        assert_eq!(change.active, vec![StateFlag::Sending]);
        h.cancel.cancel();
    }
}

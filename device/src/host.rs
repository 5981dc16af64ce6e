use std::{
    io::{BufRead, ErrorKind},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use awskit_common::{
    element::shared as shared_element, monotonic_ms, pending_slot, types::LED_COUNT,
    ButtonDebouncer, CertificateBuilder, ClientMachine, ConnectivityManager, KitAction, KitConfig,
    KitShared, MainMachine, MonotonicClock, ProvisioningHandler, SessionController, UserTask,
};
use tokio::{
    io::AsyncWriteExt,
    runtime::Handle,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    element::{cert_definitions, FileSecureElement},
    link::RumqttLink,
    radio::{HostRadio, RadioHandle},
    transport::HostTransport,
};

const SLEEP_SLICE_MS: u64 = 100;

#[derive(Clone)]
struct KitStore {
    config_path: Arc<PathBuf>,
    element_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// LEDs and the reset line. Restart stops every loop and ends the process
/// so a supervisor can start it again.
#[derive(Clone)]
struct Board {
    leds: Arc<std::sync::Mutex<[bool; LED_COUNT]>>,
    restart: mpsc::UnboundedSender<&'static str>,
    stopping: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Provision(String),
    Press(usize),
    Hold,
    Release,
    DropLink,
    Status,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = KitStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load kit config from store: {err:#}");
        KitConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();
    if let Err(err) = store.ensure_config(&config).await {
        warn!("failed to write kit config template: {err:#}");
    }

    let (signer, device) = cert_definitions();
    let element = {
        let path = store.element_path.as_ref().clone();
        let (signer, device) = (signer.clone(), device.clone());
        tokio::task::spawn_blocking(move || FileSecureElement::open(path, &signer, &device))
            .await
            .context("secure element task failed")??
    };
    info!("secure element image at {}", element.path().display());

    let shared = KitShared::new(shared_element(element));
    let radio = HostRadio::new();
    let radio_handle = radio.handle();
    let network = ConnectivityManager::new(
        radio,
        MonotonicClock,
        config.ntp_host.clone(),
        config.ntp_port,
    );
    let certs = CertificateBuilder::new(shared.element.clone(), signer, device);

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let mut main_machine = MainMachine::new(&shared, network, certs, client_tx, &config);
    let session = SessionController::new(
        HostTransport::new(),
        RumqttLink::new(Handle::current()),
        &config,
    );
    let mut client = ClientMachine::new(session, &shared, client_rx, &config);

    let presses = pending_slot();
    let debouncer = ButtonDebouncer::new(shared.client_state.clone(), presses.clone(), &config);
    let mut user = UserTask::new(&shared, presses, &config);
    let provisioning = ProvisioningHandler::new(&shared);
    let sw0 = Arc::new(AtomicBool::new(false));

    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();
    let board = Board::new(restart_tx);

    spawn_machine_loop("main", board.clone(), config.tick_ms, move |now| {
        main_machine.tick(now)
    });
    spawn_machine_loop("client", board.clone(), config.tick_ms, move |now| {
        client.tick(now)
    });
    {
        let sw0 = sw0.clone();
        spawn_machine_loop("user", board.clone(), config.tick_ms, move |now| {
            user.tick(now, sw0.load(Ordering::Relaxed))
        });
    }
    spawn_console(
        Console {
            provisioning,
            debouncer,
            radio: radio_handle,
            sw0,
            shared: shared.clone(),
            board: board.clone(),
        },
        read_stdin_lines(),
    );

    let outcome = tokio::select! {
        requested_by = restart_rx.recv() => {
            Err(anyhow::anyhow!(
                "restart requested by {} task",
                requested_by.unwrap_or("unknown")
            ))
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutting down");
            Ok(())
        }
    };
    board.stop();
    outcome
}

fn apply_env_overrides(config: &mut KitConfig) {
    config.broker_port = std::env::var("AWSKIT_BROKER_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.broker_port);
    config.ntp_host = std::env::var("AWSKIT_NTP_HOST").unwrap_or(config.ntp_host.clone());
    config.ntp_port = std::env::var("AWSKIT_NTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.ntp_port);
    config.tick_ms = std::env::var("AWSKIT_TICK_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(config.tick_ms);
}

fn spawn_machine_loop<F>(name: &'static str, board: Board, tick_ms: u64, mut tick: F)
where
    F: FnMut(u64) -> Vec<KitAction> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        debug!("{name} task started");
        while !board.is_stopping() {
            let actions = tick(monotonic_ms());
            board.apply(name, actions);
            std::thread::sleep(Duration::from_millis(tick_ms));
        }
        debug!("{name} task stopped");
    });
}

// Stdin reads block without a cancellation point, so they live on a plain
// thread the runtime does not wait for at shutdown.
fn read_stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("console read failed: {err}");
                    break;
                }
            }
        }
    });
    rx
}

struct Console {
    provisioning: ProvisioningHandler<FileSecureElement>,
    debouncer: ButtonDebouncer,
    radio: RadioHandle,
    sw0: Arc<AtomicBool>,
    shared: KitShared<FileSecureElement>,
    board: Board,
}

fn spawn_console(mut console: Console, mut lines: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines.recv().await {
            let Some(command) = parse_console(&line) else {
                if !line.trim().is_empty() {
                    warn!("unknown console command `{}`", line.trim());
                }
                continue;
            };

            let reply = match command {
                ConsoleCommand::Provision(line) => Some(tokio::task::block_in_place(|| {
                    console.provisioning.handle_line(&line)
                })),
                ConsoleCommand::Press(index) => {
                    if !console.debouncer.on_press(index, monotonic_ms()) {
                        info!("SW{} press ignored", index + 1);
                    }
                    None
                }
                ConsoleCommand::Hold => {
                    console.sw0.store(true, Ordering::Relaxed);
                    None
                }
                ConsoleCommand::Release => {
                    console.sw0.store(false, Ordering::Relaxed);
                    None
                }
                ConsoleCommand::DropLink => {
                    console.radio.drop_link();
                    None
                }
                ConsoleCommand::Status => Some(console.status_line()),
            };

            if let Some(reply) = reply {
                if let Err(err) = stdout.write_all(reply.as_bytes()).await {
                    warn!("console write failed: {err}");
                }
                let _ = stdout.flush().await;
            }
        }
        debug!("console closed");
    });
}

impl Console {
    fn status_line(&self) -> String {
        let leds = self.board.leds();
        let device = *self.shared.device();
        format!(
            "error={} client={} leds={:?} shadow_leds={:?} buttons={:?}\n",
            self.shared.errors.get().as_str(),
            self.shared.client_state.get().as_str(),
            leds,
            device.led.state,
            device.button.state,
        )
    }
}

fn parse_console(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    if head
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("aws:"))
    {
        return Some(ConsoleCommand::Provision(line.to_string()));
    }
    match head.to_ascii_lowercase().as_str() {
        "press" => {
            let button = rest.trim().parse::<usize>().ok()?;
            button.checked_sub(1).map(ConsoleCommand::Press)
        }
        "hold" => Some(ConsoleCommand::Hold),
        "release" => Some(ConsoleCommand::Release),
        "drop" => Some(ConsoleCommand::DropLink),
        "status" => Some(ConsoleCommand::Status),
        _ => None,
    }
}

impl Board {
    fn new(restart: mpsc::UnboundedSender<&'static str>) -> Self {
        Self {
            leds: Arc::new(std::sync::Mutex::new([false; LED_COUNT])),
            restart,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn leds(&self) -> [bool; LED_COUNT] {
        *self.leds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    fn set_leds(&self, update: impl FnOnce(&mut [bool; LED_COUNT])) {
        let mut leds = self.leds.lock().unwrap_or_else(PoisonError::into_inner);
        let before = *leds;
        update(&mut leds);
        if *leds != before {
            info!("leds {:?}", *leds);
        }
    }

    fn apply(&self, task: &'static str, actions: Vec<KitAction>) {
        for action in actions {
            match action {
                KitAction::SetLed(index, on) => self.set_leds(|leds| {
                    if let Some(led) = leds.get_mut(index) {
                        *led = on;
                    }
                }),
                KitAction::AllLedsOn => self.set_leds(|leds| *leds = [true; LED_COUNT]),
                KitAction::AllLedsOff => self.set_leds(|leds| *leds = [false; LED_COUNT]),
                KitAction::Sleep(ms) => {
                    debug!("{task} task sleeping {ms} ms");
                    self.sleep(ms);
                }
                KitAction::Restart => {
                    warn!("{task} task requested a restart");
                    self.stop();
                    if self.restart.send(task).is_err() {
                        warn!("restart request from {task} task dropped; supervisor gone");
                    }
                    return;
                }
            }
        }
    }

    fn sleep(&self, ms: u64) {
        let mut left = ms;
        while left > 0 && !self.is_stopping() {
            let slice = left.min(SLEEP_SLICE_MS);
            std::thread::sleep(Duration::from_millis(slice));
            left -= slice;
        }
    }
}

impl KitStore {
    fn new() -> Self {
        let data_dir = std::env::var("AWSKIT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.awskit"));

        Self {
            config_path: Arc::new(data_dir.join("kit.json")),
            element_path: Arc::new(data_dir.join("element.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<KitConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<KitConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(KitConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `config` only when no config file exists yet.
    async fn ensure_config(&self, config: &KitConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

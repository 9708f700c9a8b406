//! Standalone Linux runner for the flowsentry engine.
//!
//! Opens a TUN device, wires file-backed sinks into the engine, and runs
//! until interrupted. Route configuration is left to the operator.

use anyhow::Context;
use flowsentry::blocklist::FileBlocklistStore;
use flowsentry::hooks::{
    AlertSink, AnomalyAlert, FeedbackRecord, FlowRecord, OwnerResolver, PersistenceSink,
    ProfileRecord, TunReader, TunWriter, UNKNOWN_UID,
};
use flowsentry::{Config, Engine, EngineHooks};
use parking_lot::Mutex;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

static STOP: AtomicBool = AtomicBool::new(false);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::parse()?;
    let config = match settings.config.as_ref() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {:?}", settings.data_dir))?;

    let (reader, writer, ifname) = open_tun(settings.ifname.as_deref())?;
    println!(
        "created interface {ifname}. Configure it (as root) via:\n  sudo ip link set {ifname} up\n  sudo ip addr add 10.0.0.2/24 dev {ifname}\n  sudo ip link set {ifname} mtu 1500"
    );

    let sink = Arc::new(JsonlSink::open(&settings.data_dir)?);
    let hooks = EngineHooks {
        resolver: Arc::new(StubResolver),
        sink,
        alerts: Arc::new(LogAlertSink),
        blocklist_store: Box::new(FileBlocklistStore::new(
            settings.data_dir.join("blocklist.txt"),
        )),
    };

    let engine = Engine::new(config, hooks)?;
    engine.start(Box::new(reader), Box::new(writer))?;
    info!("engine running on {ifname}, press Ctrl+C to terminate");

    install_sigint_handler();
    while !STOP.load(Ordering::SeqCst) && engine.is_running() {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutting down");
    engine.stop()?;
    let stats = engine.stats();
    info!(
        packets = stats.reactor.packets_in,
        frames_out = stats.reactor.frames_to_guest,
        flows = stats.table.flows_created,
        "final counters"
    );
    Ok(())
}

#[derive(Debug)]
struct Settings {
    ifname: Option<String>,
    config: Option<PathBuf>,
    data_dir: PathBuf,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut ifname = None;
        let mut config = None;
        let mut data_dir = PathBuf::from("./flowsentry-data");
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--ifname" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--ifname requires a value"))?;
                    if value.is_empty() {
                        anyhow::bail!("--ifname requires a non-empty value");
                    }
                    ifname = Some(value);
                }
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                    config = Some(PathBuf::from(value));
                }
                "--data-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--data-dir requires a value"))?;
                    data_dir = PathBuf::from(value);
                }
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported: --ifname <name>, --config <path>, --data-dir <path>",
                        arg
                    );
                }
            }
        }
        Ok(Self {
            ifname,
            config,
            data_dir,
        })
    }
}

struct TunFile(File);

impl TunReader for TunFile {
    fn read_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl TunWriter for TunFile {
    fn write_datagram(&mut self, frame: &[u8]) -> io::Result<()> {
        self.0.write_all(frame)
    }
}

#[cfg(target_os = "linux")]
fn open_tun(ifname: Option<&str>) -> anyhow::Result<(TunFile, TunFile, String)> {
    use std::ffi::CStr;
    use std::mem::zeroed;
    use std::os::fd::AsRawFd;

    const TUN_DEVICE: &str = "/dev/net/tun";
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .with_context(|| format!("opening {TUN_DEVICE}"))?;
    let fd = file.as_raw_fd();

    let mut ifreq: libc::ifreq = unsafe { zeroed() };
    if let Some(name) = ifname {
        for (idx, byte) in name.as_bytes().iter().enumerate() {
            if idx >= libc::IFNAMSIZ - 1 {
                break;
            }
            ifreq.ifr_name[idx] = *byte as libc::c_char;
        }
    }
    ifreq.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

    let status = unsafe { libc::ioctl(fd, libc::TUNSETIFF, &ifreq) };
    if status < 0 {
        return Err(io::Error::last_os_error()).context("TUNSETIFF failed");
    }

    let name = unsafe {
        CStr::from_ptr(ifreq.ifr_name.as_ptr())
            .to_string_lossy()
            .into_owned()
    };
    let reader = file.try_clone().context("cloning tun descriptor")?;
    Ok((TunFile(reader), TunFile(file), name))
}

#[cfg(not(target_os = "linux"))]
fn open_tun(_ifname: Option<&str>) -> anyhow::Result<(TunFile, TunFile, String)> {
    anyhow::bail!("the standalone runner currently supports only Linux")
}

fn install_sigint_handler() {
    #[cfg(unix)]
    unsafe {
        extern "C" fn on_signal(_signal: libc::c_int) {
            STOP.store(true, Ordering::SeqCst);
        }
        let handler = on_signal as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// The ownership lookup belongs to the host platform; the standalone runner
/// has no per-app socket attribution and reports every flow as unknown.
struct StubResolver;

impl OwnerResolver for StubResolver {
    fn uid_for(&self, _protocol: u8, _local: SocketAddrV4, _remote: SocketAddrV4) -> i32 {
        UNKNOWN_UID
    }

    fn app_name(&self, _uid: i32) -> Option<String> {
        None
    }
}

/// Append-only JSONL files, one per record kind.
struct JsonlSink {
    flows: Mutex<File>,
    profiles: Mutex<File>,
    feedback: Mutex<File>,
}

impl JsonlSink {
    fn open(dir: &std::path::Path) -> anyhow::Result<Self> {
        let open = |name: &str| -> anyhow::Result<Mutex<File>> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
                .with_context(|| format!("opening {name}"))?;
            Ok(Mutex::new(file))
        };
        Ok(Self {
            flows: open("flows.jsonl")?,
            profiles: open("profiles.jsonl")?,
            feedback: open("feedback.jsonl")?,
        })
    }

    fn append<T: serde::Serialize>(file: &Mutex<File>, row: &T) -> io::Result<()> {
        let line = serde_json::to_string(row)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        let mut guard = file.lock();
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")
    }
}

impl PersistenceSink for JsonlSink {
    fn record_flows(&self, rows: &[FlowRecord]) -> io::Result<()> {
        for row in rows {
            Self::append(&self.flows, row)?;
        }
        Ok(())
    }

    fn record_profile(&self, row: &ProfileRecord) -> io::Result<()> {
        Self::append(&self.profiles, row)
    }

    fn record_feedback(&self, row: &FeedbackRecord) -> io::Result<()> {
        Self::append(&self.feedback, row)
    }
}

/// Alerts go to the log; a real host would raise a notification.
struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: &AnomalyAlert) {
        warn!(
            severity = alert.severity.as_str(),
            app = %alert.app_name,
            score = alert.score,
            flow = %alert.flow_key,
            reasons = %alert.reasons.join("; "),
            "anomaly detected"
        );
    }
}

//! SPTP-Koordinator
//!
//! Besitzt Sockets, Clients, Servo und Uhr. Pro Tick werden alle
//! Austausche parallel angestoßen, die Ergebnisse durch BMCA geschickt
//! und die Uhr nachgeführt; bei schlechten Ticks hält der Servo die
//! mittlere Frequenz (Holdover).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::BytesMut;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, FreeRunningClock, PhcClock, SysClock};
use crate::config::{Config, TimestampingMode};
use crate::net::{open_udp_socket, TsError, TsSocket};
use crate::ptp::{
    self, probe_message_type, Announce, AnnounceBody, ClockIdentity, MessageType, Packet,
    PortIdentity, PtpTimestamp, SyncDelayReq, PTP_EVENT_PORT, PTP_GENERAL_PORT,
};
use crate::servo::{PiServo, ServoState};
use crate::stats::Stats;
use crate::sync::client::{InPacket, SequenceMask, SptpClient};
use crate::sync::{
    reprioritize, select_best, Backoff, BmcaConfig, ExchangeError, MeasurementResult,
};

/// Lese-Timeout der Listener, begrenzt die Shutdown-Latenz
const LISTENER_POLL: Duration = Duration::from_millis(200);

/// Ergebnis eines Austauschs mit einem GM
#[derive(Debug)]
pub struct RunResult {
    pub addr: IpAddr,
    pub measurement: Option<MeasurementResult>,
    pub error: Option<ExchangeError>,
}

/// Der SPTP-Client-Koordinator
pub struct Sptp {
    config: Config,
    clock: Clock,
    servo: PiServo,
    stats: Arc<Stats>,
    clients: HashMap<IpAddr, Arc<Mutex<SptpClient>>>,
    /// Routing-Tabelle der Listener: Quelladresse → Client-Inbox
    routes: HashMap<IpAddr, mpsc::Sender<InPacket>>,
    priorities: HashMap<IpAddr, u8>,
    backoffs: HashMap<IpAddr, Backoff>,
    best_gm: Option<IpAddr>,
    event_sockets: Vec<Arc<TsSocket>>,
    general_socket: Arc<UdpSocket>,
    /// Serialisiert Probe-Antworten gegen Client-Sends auf dem geteilten
    /// Event-Socket
    tx_serialize: Option<Arc<Mutex<()>>>,
    port_identity: PortIdentity,
    running: Arc<AtomicBool>,
    listener_error: Arc<Mutex<Option<anyhow::Error>>>,
    listeners: Vec<JoinHandle<()>>,
    last_tick: Option<Instant>,
}

impl Sptp {
    /// Sockets öffnen und alles verdrahten
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let general = open_udp_socket(
            SocketAddr::new(config.listen_address, PTP_GENERAL_PORT),
            Some(&config.iface),
            config.dscp,
        )
        .context("General-Port (320) konnte nicht geöffnet werden")?;

        let socket_count = if config.parallel_tx {
            config.servers.len()
        } else {
            1
        };
        let mut event_sockets = Vec::with_capacity(socket_count);
        for _ in 0..socket_count {
            let sock = open_udp_socket(
                SocketAddr::new(config.listen_address, PTP_EVENT_PORT),
                Some(&config.iface),
                config.dscp,
            )
            .context("Event-Port (319) konnte nicht geöffnet werden")?;
            let ts_sock = TsSocket::new(
                sock,
                Some(&config.iface),
                config.timestamping.ts_mode(),
                config.attempts_txts,
                config.timeout_txts(),
            )
            .context("Timestamping konnte nicht aktiviert werden")?;
            event_sockets.push(ts_sock);
        }

        let clock = build_clock(&config)?;
        Self::with_sockets(config, general, event_sockets, clock)
    }

    /// Verdrahtung mit bereits geöffneten Sockets (auch für Tests)
    fn with_sockets(
        config: Config,
        general: UdpSocket,
        event_sockets: Vec<TsSocket>,
        mut clock: Clock,
    ) -> Result<Self> {
        general.set_read_timeout(Some(LISTENER_POLL))?;
        let mut shared_sockets = Vec::with_capacity(event_sockets.len());
        for sock in event_sockets {
            sock.set_read_timeout(Some(LISTENER_POLL))?;
            shared_sockets.push(Arc::new(sock));
        }

        let stats = Arc::new(Stats::new());
        let start_freq = match clock.frequency_ppb() {
            Ok(freq) => freq,
            Err(e) => {
                warn!("Startfrequenz nicht lesbar ({}), beginne bei 0ppb", e);
                0.0
            }
        };
        let servo = PiServo::new(config.servo, start_freq, clock.max_freq_ppb());
        let port_identity = local_port_identity();
        let seq_mask = SequenceMask::new(
            config.sequence_id_mask_bits,
            config.sequence_id_mask_value,
        );
        let tx_serialize = if config.parallel_tx {
            None
        } else {
            Some(Arc::new(Mutex::new(())))
        };

        let mut clients = HashMap::new();
        let mut routes = HashMap::new();
        let mut priorities = HashMap::new();
        let mut backoffs = HashMap::new();
        for (index, (ip, rank)) in config.server_addrs()?.into_iter().enumerate() {
            let socket = if config.parallel_tx {
                shared_sockets[index].clone()
            } else {
                shared_sockets[0].clone()
            };
            let (inbox_tx, inbox_rx) = mpsc::channel();
            let client = SptpClient::new(
                SocketAddr::new(ip, PTP_EVENT_PORT),
                socket,
                tx_serialize.clone(),
                port_identity,
                config.domain_number,
                seq_mask,
                config.alternate_port_offset,
                config.measurement,
                inbox_rx,
                stats.clone(),
            );
            clients.insert(ip, Arc::new(Mutex::new(client)));
            routes.insert(ip, inbox_tx);
            priorities.insert(ip, rank);
            backoffs.insert(ip, Backoff::new(config.backoff));
        }

        Ok(Self {
            config,
            clock,
            servo,
            stats,
            clients,
            routes,
            priorities,
            backoffs,
            best_gm: None,
            event_sockets: shared_sockets,
            general_socket: Arc::new(general),
            tx_serialize,
            port_identity,
            running: Arc::new(AtomicBool::new(false)),
            listener_error: Arc::new(Mutex::new(None)),
            listeners: Vec::new(),
            last_tick: None,
        })
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Hauptschleife: Listener starten, dann bis zum Shutdown ticken
    pub async fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        self.spawn_listeners()?;

        info!(
            "SPTP Client läuft: {} GM, Intervall {:?}, Uhr {}",
            self.clients.len(),
            self.config.interval(),
            self.clock.name()
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let listener_err = self.listener_error.lock().take();
                    if let Some(err) = listener_err {
                        self.shutdown();
                        return Err(err.context("Listener abgebrochen"));
                    }
                    self.run_tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown-Signal empfangen");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Uhr auf der mittleren Frequenz parken und Listener beenden
    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let freq = self.servo.mean_freq();
        info!("Parke Uhr bei mittlerer Frequenz {:.3}ppb", freq);
        self.apply_freq(freq);
        for handle in self.listeners.drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_listeners(&mut self) -> Result<()> {
        {
            if let Ok(addr) = self.general_socket.local_addr() {
                info!("General-Listener auf {}", addr);
            }
            let running = self.running.clone();
            let socket = self.general_socket.clone();
            let routes = self.routes.clone();
            let stats = self.stats.clone();
            let err_slot = self.listener_error.clone();
            let handle = std::thread::Builder::new()
                .name("sptp-general".into())
                .spawn(move || {
                    if let Err(e) = run_general_listener(&running, &socket, &routes, &stats) {
                        error!("General-Listener beendet: {}", e);
                        *err_slot.lock() = Some(e);
                        running.store(false, Ordering::Relaxed);
                    }
                })
                .context("General-Listener-Thread")?;
            self.listeners.push(handle);
        }

        for (index, socket) in self.event_sockets.iter().enumerate() {
            if let Ok(addr) = socket.local_addr() {
                info!("Event-Listener {} auf {}", index, addr);
            }
            let running = self.running.clone();
            let socket = socket.clone();
            let routes = self.routes.clone();
            let stats = self.stats.clone();
            let err_slot = self.listener_error.clone();
            let port_identity = self.port_identity;
            let domain = self.config.domain_number;
            let tx_serialize = self.tx_serialize.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sptp-event-{}", index))
                .spawn(move || {
                    if let Err(e) = run_event_listener(
                        &running,
                        &socket,
                        &routes,
                        &stats,
                        port_identity,
                        domain,
                        tx_serialize.as_deref(),
                    ) {
                        error!("Event-Listener beendet: {}", e);
                        *err_slot.lock() = Some(e);
                        running.store(false, Ordering::Relaxed);
                    }
                })
                .context("Event-Listener-Thread")?;
            self.listeners.push(handle);
        }
        Ok(())
    }

    /// Ein Tick: alle Austausche parallel, dann Auswertung
    async fn run_tick(&mut self) {
        let tick_start = Instant::now();
        let timeout = self.config.exchange_timeout();

        let mut results: Vec<RunResult> = Vec::with_capacity(self.clients.len());
        let mut tasks = Vec::new();
        for (addr, client) in &self.clients {
            let backoff_value = self
                .backoffs
                .get(addr)
                .filter(|b| b.is_active())
                .map(|b| b.value());
            if let Some(value) = backoff_value {
                debug!("{} im Backoff ({:?} verbleibend), Austausch übersprungen", addr, value);
                results.push(RunResult {
                    addr: *addr,
                    measurement: None,
                    error: Some(ExchangeError::BackoffSkip(value)),
                });
                continue;
            }
            let client = client.clone();
            let addr = *addr;
            tasks.push(tokio::task::spawn_blocking(move || {
                let mut client = client.lock();
                match client.run_once(timeout) {
                    Ok(m) => RunResult {
                        addr,
                        measurement: Some(m),
                        error: None,
                    },
                    Err(e) => RunResult {
                        addr,
                        measurement: None,
                        error: Some(e),
                    },
                }
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Austausch-Task abgestürzt: {}", e),
            }
        }

        self.process_results(results);
        self.stats.set_tick_duration(tick_start.elapsed());
    }

    /// Auswertung eines Ticks: Backoff, BMCA, Servo, Uhr
    fn process_results(&mut self, results: Vec<RunResult>) {
        let interval = self.config.interval();
        let now = Instant::now();
        let bad_tick = match self.last_tick {
            Some(prev) => {
                let delta = now.duration_since(prev);
                delta < interval.mul_f64(0.9) || delta > interval.mul_f64(1.1)
            }
            None => false,
        };
        self.last_tick = Some(now);

        let mut candidates: HashMap<IpAddr, Announce> = HashMap::new();
        let mut measurements: HashMap<IpAddr, MeasurementResult> = HashMap::new();
        for result in results {
            if let Some(err) = result.error {
                self.handle_exchange_error(result.addr, &err, interval);
                continue;
            }
            let Some(m) = result.measurement else {
                continue;
            };
            if let Some(backoff) = self.backoffs.get_mut(&result.addr) {
                backoff.reset();
            }
            self.stats.set_backoff(result.addr, false, 0);
            self.stats.update_measurement(result.addr, &m);
            if m.bad_delay {
                debug!("{}: Pfad-Delay-Sample gefiltert", result.addr);
            }
            if m.has_negative_cf() {
                warn!(
                    "{}: negatives Correction-Field (rx {}ns, tx {}ns), von BMCA ausgeschlossen",
                    result.addr, m.cf_rx_ns, m.cf_tx_ns
                );
            } else {
                candidates.insert(result.addr, m.announce);
            }
            measurements.insert(result.addr, m);
        }

        let bmca_config = BmcaConfig {
            max_clock_class: self.config.max_clock_class,
            max_clock_accuracy: self.config.max_clock_accuracy,
        };
        let Some((best_addr, _)) = select_best(&candidates, &self.priorities, &bmca_config)
        else {
            warn!("Kein Best Master verfügbar, Holdover");
            self.best_gm = None;
            self.stats.set_selected(None);
            self.enter_holdover();
            return;
        };

        if self.best_gm != Some(best_addr) {
            info!("Neuer Best Master: {} (vorher {:?})", best_addr, self.best_gm);
            reprioritize(best_addr, &mut self.priorities);
            self.best_gm = Some(best_addr);
            self.stats.inc_port_changes();
        }
        self.stats.set_selected(Some(best_addr));

        let Some(best) = measurements.get(&best_addr) else {
            return;
        };

        if self.servo.is_spike(best.offset_ns) {
            warn!(
                "{}: Spike-Offset {}ns verworfen, Sample wird nicht angewandt",
                best_addr, best.offset_ns
            );
            let freq = self.servo.mean_freq();
            self.apply_freq(freq);
            self.stats.set_servo(self.servo.state() as u8, freq);
            return;
        }

        if bad_tick {
            warn!("Tick-Abstand außerhalb ±10% des Intervalls, Holdover");
            self.enter_holdover();
            return;
        }

        let (freq_adj, state) = self.servo.sample(best.offset_ns, best.timestamp_ns as u64);
        match state {
            ServoState::Jump => {
                info!("Uhr wird um {}ns gestellt", -best.offset_ns);
                if let Err(e) = self.clock.step(-best.offset_ns) {
                    error!("Uhr-Schritt fehlgeschlagen: {}", e);
                }
            }
            ServoState::Locked => {
                self.apply_freq(freq_adj);
                if let Err(e) = self.clock.set_sync() {
                    warn!("Sync-Markierung fehlgeschlagen: {}", e);
                }
            }
            _ => {}
        }
        self.stats.set_servo(state as u8, freq_adj);

        let t2_utc = chrono::DateTime::<chrono::Utc>::from_timestamp_nanos(best.t2);
        info!(
            "{}: offset {}ns delay {:.0}ns servo {} (T2 {})",
            best_addr, best.offset_ns, best.delay_ns, state, t2_utc
        );
    }

    /// Fehler-Taxonomie: BackoffSkip dekrementiert, alles andere erhöht
    fn handle_exchange_error(&mut self, addr: IpAddr, err: &ExchangeError, interval: Duration) {
        let Some(backoff) = self.backoffs.get_mut(&addr) else {
            return;
        };
        match err {
            ExchangeError::BackoffSkip(_) => {
                let remaining = backoff.dec(interval);
                self.stats
                    .set_backoff(addr, backoff.is_active(), remaining.as_secs());
            }
            other => {
                let value = backoff.inc();
                warn!("Austausch mit {} fehlgeschlagen: {}", addr, other);
                self.stats.record_error(addr);
                self.stats.set_backoff(addr, backoff.is_active(), value);
            }
        }
    }

    fn enter_holdover(&mut self) {
        let freq = self.servo.enter_holdover();
        self.apply_freq(freq);
        self.stats.set_servo(self.servo.state() as u8, freq);
    }

    /// Frequenzkorrektur anwenden; Fehler werden gezählt, nie fatal
    fn apply_freq(&mut self, freq_adj: f64) {
        if let Err(e) = self.clock.adj_freq_ppb(-freq_adj) {
            error!("Frequenzkorrektur fehlgeschlagen: {}", e);
        }
    }
}

fn build_clock(config: &Config) -> Result<Clock> {
    if config.free_running {
        return Ok(Clock::FreeRunning(FreeRunningClock));
    }
    match config.timestamping {
        TimestampingMode::Hw => Ok(Clock::Phc(
            PhcClock::open_for_iface(&config.iface)
                .with_context(|| format!("PHC für {} nicht verfügbar", config.iface))?,
        )),
        TimestampingMode::Sw => Ok(Clock::System(SysClock::new())),
    }
}

/// Clock-Identity aus Prozess-ID plus Zufall; bewusst explizit statt
/// prozessweitem Zustand
fn local_port_identity() -> PortIdentity {
    let pid = std::process::id().to_be_bytes();
    let salt: [u8; 4] = rand::random();
    PortIdentity {
        clock_identity: ClockIdentity([
            pid[0], pid[1], pid[2], pid[3], salt[0], salt[1], salt[2], salt[3],
        ]),
        port_number: 1,
    }
}

fn wall_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// General-Port: Announces der bekannten GMs an die Clients routen
fn run_general_listener(
    running: &AtomicBool,
    socket: &UdpSocket,
    routes: &HashMap<IpAddr, mpsc::Sender<InPacket>>,
    stats: &Stats,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, src)) => {
                // billige Typ-Probe vor dem vollen Parse im Client
                if probe_message_type(&buf[..n]) != Some(MessageType::Announce) {
                    debug!("Nicht-Announce auf General-Port von {} verworfen", src);
                    stats.inc_rx_unsupported();
                    continue;
                }
                match routes.get(&src.ip()) {
                    Some(inbox) => {
                        let _ = inbox.send(InPacket {
                            payload: buf[..n].to_vec(),
                            rx_timestamp_ns: None,
                        });
                    }
                    None => {
                        debug!("General-Paket von unbekannter Quelle {} verworfen", src);
                        stats.inc_rx_unsupported();
                    }
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Timeout, weiter - Shutdown-Check
            }
            Err(e) => return Err(anyhow::Error::from(e).context("General-Port Lesefehler")),
        }
    }
    Ok(())
}

/// Event-Port: Syncs mit RX-Timestamp routen, ptping-Proben beantworten
fn run_event_listener(
    running: &AtomicBool,
    socket: &TsSocket,
    routes: &HashMap<IpAddr, mpsc::Sender<InPacket>>,
    stats: &Stats,
    port_identity: PortIdentity,
    domain: u8,
    tx_serialize: Option<&Mutex<()>>,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    let mut out = BytesMut::with_capacity(128);
    while running.load(Ordering::Relaxed) {
        match socket.recv_with_ts(&mut buf) {
            Ok((n, src, rx_ts)) => match routes.get(&src.ip()) {
                Some(inbox) => {
                    let _ = inbox.send(InPacket {
                        payload: buf[..n].to_vec(),
                        rx_timestamp_ns: Some(rx_ts),
                    });
                }
                None => {
                    answer_probe(
                        socket,
                        &buf[..n],
                        src,
                        rx_ts,
                        port_identity,
                        domain,
                        stats,
                        tx_serialize,
                        &mut out,
                    );
                }
            },
            Err(TsError::ZeroTimestamp) => {
                warn!("Event-Paket ohne RX-Timestamp verworfen");
                stats.inc_rx_unsupported();
            }
            Err(TsError::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Timeout, weiter - Shutdown-Check
            }
            Err(e) => return Err(anyhow::Error::from(e).context("Event-Port Lesefehler")),
        }
    }
    Ok(())
}

/// ptping-Probe: Delay-Request einer unbekannten Quelle wird mit einem
/// Sync (RX-Timestamp als T4) und einem Announce beantwortet
#[allow(clippy::too_many_arguments)]
fn answer_probe(
    socket: &TsSocket,
    payload: &[u8],
    src: SocketAddr,
    rx_ts: i64,
    port_identity: PortIdentity,
    domain: u8,
    stats: &Stats,
    tx_serialize: Option<&Mutex<()>>,
    out: &mut BytesMut,
) {
    let req = match ptp::parse(payload) {
        Ok(Packet::DelayReq(req, _)) => req,
        Ok(_) => {
            debug!("Event-Paket von unbekannter Quelle {} verworfen", src);
            stats.inc_rx_unsupported();
            return;
        }
        Err(e) => {
            debug!("Defektes Paket von {}: {}", src, e);
            stats.inc_rx_unsupported();
            return;
        }
    };

    let seq = req.header.sequence_id;
    let sync = SyncDelayReq::sync(port_identity, domain, seq, PtpTimestamp::from_nanos(rx_ts));
    let announce = Announce::unicast(
        port_identity,
        domain,
        seq,
        AnnounceBody {
            origin_timestamp: PtpTimestamp::from_nanos(wall_now_ns()),
            ..AnnounceBody::default()
        },
    );

    let _guard = tx_serialize.map(|l| l.lock());
    sync.serialize(None, out);
    if let Err(e) = socket.send_to(out, src) {
        warn!("Probe-Antwort (Sync) an {} fehlgeschlagen: {}", src, e);
        return;
    }
    announce.serialize(out);
    if let Err(e) = socket.send_to(out, src) {
        warn!("Probe-Antwort (Announce) an {} fehlgeschlagen: {}", src, e);
        return;
    }
    stats.inc_probes_answered();
    debug!("ptping-Probe von {} beantwortet (seq {})", src, seq);
}

mod dtc;
mod expr;
mod gps_ingress;
mod hud_state;
mod http_surface;
mod influx;
mod lap_timing;
mod param_catalog;
mod publisher;
mod records_store;
mod spool;
mod ssm2;
mod telemetry_loop;
mod track_geometry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use hud_state::HudState;
use influx::{InfluxConfig, InfluxWriter};
use param_catalog::ParamCatalog;
use records_store::RecordsStore;
use ssm2::{read_chunked, ChunkedReadOptions, SSM2Client, SerialLink};
use track_geometry::{LatLon, TrackGeometry};

#[derive(Parser, Debug)]
#[command(name = "subaru-telemetry", version, about = "SSM2 ECU telemetry, track timing, and dashboard backend")]
struct Cli {
    /// Serial port the ECU's K-line adapter is attached to.
    #[arg(long, env = "SUBARU_PORT", default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate for the K-line adapter.
    #[arg(long, env = "SUBARU_BAUD", default_value_t = 4800)]
    baud: u32,

    /// ECU address byte, e.g. 0x10.
    #[arg(long, env = "SUBARU_ECU_ADDR", default_value = "0x10")]
    ecu: String,

    /// Pad/source address byte used in outgoing frames.
    #[arg(long, env = "SUBARU_PAD_ADDR", default_value = "0x00")]
    pad: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read ECU SYS/ROM ID and flagbyte count.
    Info,
    /// Read raw byte values from one or more addresses.
    Raw {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Stream decoded parameters to stdout without publishing anywhere.
    Stream {
        #[arg(long, default_value_t = 5.0)]
        hz: f64,
        #[arg(long, default_value = "road")]
        profile: String,
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Run the full program: TelemetryLoop + GpsIngress + HttpSurface together.
    Mqtt {
        #[arg(long, default_value_t = 2.0)]
        hz: f64,
        #[arg(long, default_value = "road")]
        profile: String,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long, default_value = "subaru")]
        topic_base: String,
        #[arg(long, default_value = "subaru/status")]
        status_topic: String,
        #[arg(long, default_value = "subaru/dtc")]
        dtc_topic: String,
        #[arg(long, default_value = "127.0.0.1")]
        mqtt_host: String,
        #[arg(long, default_value_t = 1883)]
        mqtt_port: u16,
        #[arg(long, default_value_t = 10000)]
        max_spool_entries: usize,
        #[arg(long, default_value = "spool.jsonl")]
        spool_file: PathBuf,
        #[arg(long, default_value = "state.json")]
        state_file: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        backoff_min: f64,
        #[arg(long, default_value_t = 30.0)]
        backoff_max: f64,
        #[arg(long)]
        track_file: PathBuf,
        #[arg(long, default_value = "records.json")]
        records_file: PathBuf,
        #[arg(long, default_value = "subaru/gps")]
        gps_topic: String,
        #[arg(long, default_value = "drivers")]
        events_topic_base: String,
        #[arg(long, default_value_t = 8080)]
        http_port: u16,
        #[arg(long, value_delimiter = ',', default_value = "Beerens,Frenchy,Dave,Noah,Stig")]
        drivers: Vec<String>,
        #[arg(long)]
        influx_url: Option<String>,
        #[arg(long, default_value = "subaru")]
        influx_db: String,
        /// FreeSSM English DTC definitions source, enabling code/title lookup
        /// on the DTC cadence. Without it, DTC polls count bit hits only.
        #[arg(long)]
        dtc_defs_file: Option<PathBuf>,
    },
    /// Read and print currently-set DTCs, mirroring `read_error_codes.py`.
    ReadDtc {
        #[arg(long)]
        defs_file: PathBuf,
    },
}

fn parse_addr(s: &str) -> anyhow::Result<u8> {
    let trimmed = s.trim();
    let value = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)?
    } else {
        trimmed.parse()?
    };
    Ok(value)
}

fn parse_addr_u32(s: &str) -> anyhow::Result<u32> {
    let trimmed = s.trim();
    let value = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)?
    } else {
        trimmed.parse()?
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let ecu_addr = parse_addr(&cli.ecu)?;
    let pad_addr = parse_addr(&cli.pad)?;

    match cli.command {
        Command::Info => run_info(&cli.port, cli.baud, ecu_addr, pad_addr).await,
        Command::Raw { addresses } => run_raw(&cli.port, cli.baud, ecu_addr, pad_addr, addresses).await,
        Command::Stream { hz, profile, catalog } => run_stream(&cli.port, cli.baud, ecu_addr, pad_addr, hz, &profile, &catalog).await,
        Command::Mqtt {
            hz,
            profile,
            catalog,
            topic_base,
            status_topic,
            dtc_topic,
            mqtt_host,
            mqtt_port,
            max_spool_entries,
            spool_file,
            state_file,
            backoff_min,
            backoff_max,
            track_file,
            records_file,
            gps_topic,
            events_topic_base,
            http_port,
            drivers,
            influx_url,
            influx_db,
            dtc_defs_file,
        } => {
            let loop_config = telemetry_loop::TelemetryLoopConfig {
                serial_path: cli.port,
                baud_rate: cli.baud,
                ecu_addr,
                pad_addr,
                period: Duration::from_secs_f64(1.0 / hz.max(0.1)),
                backoff_min: Duration::from_secs_f64(backoff_min.max(0.1)),
                backoff_max: Duration::from_secs_f64(backoff_max.max(backoff_min)),
                chunk_size: 16,
                read_retries: 3,
                read_inter_delay: Duration::from_millis(30),
                flush_per_loop: 50,
                dtc_interval: Duration::from_secs(300),
                status_interval: Duration::from_secs(30),
                base_topic: topic_base,
                status_topic,
                dtc_topic,
                profile,
                state_file,
            };
            run_mqtt(RunMqttArgs {
                loop_config,
                catalog_path: catalog,
                mqtt_host,
                mqtt_port,
                max_spool_entries,
                spool_file,
                track_file,
                records_file,
                gps_topic,
                events_topic_base,
                http_port,
                drivers,
                influx_url,
                influx_db,
                dtc_defs_file,
            })
            .await
        }
        Command::ReadDtc { defs_file } => run_read_dtc(&cli.port, cli.baud, ecu_addr, pad_addr, &defs_file).await,
    }
}

fn open_client(port: &str, baud: u32, ecu_addr: u8, pad_addr: u8) -> anyhow::Result<SSM2Client<SerialLink>> {
    let link = SerialLink::open(port, baud, Duration::from_millis(50))?;
    Ok(SSM2Client::new(link, ecu_addr, pad_addr))
}

async fn run_info(port: &str, baud: u32, ecu_addr: u8, pad_addr: u8) -> anyhow::Result<()> {
    let mut client = open_client(port, baud, ecu_addr, pad_addr)?;
    let identity = client.get_cu_data(Duration::from_secs(1))?;
    println!("sys_id={} rom_id={} flagbytes={}", identity.sys_id_hex(), identity.rom_id_hex(), identity.flagbytes.len());
    Ok(())
}

async fn run_raw(port: &str, baud: u32, ecu_addr: u8, pad_addr: u8, addresses: Vec<String>) -> anyhow::Result<()> {
    let mut client = open_client(port, baud, ecu_addr, pad_addr)?;
    let addrs: Vec<u32> = addresses.iter().map(|s| parse_addr_u32(s)).collect::<anyhow::Result<_>>()?;
    let values = client.read_multiple(&addrs, Duration::from_secs(1))?;
    for (addr, value) in addrs.iter().zip(values.iter()) {
        println!("0x{addr:04X} = 0x{value:02X} ({value})");
    }
    Ok(())
}

async fn run_stream(port: &str, baud: u32, ecu_addr: u8, pad_addr: u8, hz: f64, profile: &str, catalog_path: &PathBuf) -> anyhow::Result<()> {
    let mut client = open_client(port, baud, ecu_addr, pad_addr)?;
    let xml = std::fs::read_to_string(catalog_path)?;
    let catalog = ParamCatalog::load_from_str(&xml)?;
    let ecu = telemetry_loop::init_ecu(&mut client, &catalog, None, profile).await?;
    info!(rom_id = %ecu.identity.rom_id_hex(), params = ecu.params.len(), "stream starting");

    let period = Duration::from_secs_f64(1.0 / hz.max(0.1));
    let mut seq: u64 = 0;
    loop {
        let start = std::time::Instant::now();
        let config = telemetry_loop::TelemetryLoopConfig {
            serial_path: port.to_string(),
            baud_rate: baud,
            ecu_addr,
            pad_addr,
            period,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            chunk_size: 16,
            read_retries: 3,
            read_inter_delay: Duration::from_millis(30),
            flush_per_loop: 0,
            dtc_interval: Duration::from_secs(300),
            status_interval: Duration::from_secs(30),
            base_topic: String::new(),
            status_topic: String::new(),
            dtc_topic: String::new(),
            profile: profile.to_string(),
            state_file: PathBuf::new(),
        };
        match telemetry_loop::read_sample(&mut client, &ecu, &config) {
            Ok(values) => {
                seq += 1;
                let sample = telemetry_loop::build_sample(seq, &ecu, &values, profile);
                println!("{sample}");
            }
            Err(err) => warn!(error = %err, "sample read failed"),
        }
        tokio::time::sleep(telemetry_loop::next_sleep(period, start.elapsed())).await;
    }
}

struct RunMqttArgs {
    loop_config: telemetry_loop::TelemetryLoopConfig,
    catalog_path: PathBuf,
    mqtt_host: String,
    mqtt_port: u16,
    max_spool_entries: usize,
    spool_file: PathBuf,
    track_file: PathBuf,
    records_file: PathBuf,
    gps_topic: String,
    events_topic_base: String,
    http_port: u16,
    drivers: Vec<String>,
    influx_url: Option<String>,
    influx_db: String,
    dtc_defs_file: Option<PathBuf>,
}

/// Runs the full program: the ECU sample/publish loop and the GPS lap-timing
/// ingress as background tasks, with the read-only HTTP surface in the
/// foreground.
async fn run_mqtt(args: RunMqttArgs) -> anyhow::Result<()> {
    let track_json = std::fs::read_to_string(&args.track_file)?;
    let raw: serde_json::Value = serde_json::from_str(&track_json)?;
    let points: Vec<LatLon> = raw["points"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("track file missing points array"))?
        .iter()
        .map(|p| LatLon { lat: p["lat"].as_f64().unwrap_or(0.0), lon: p["lon"].as_f64().unwrap_or(0.0) })
        .collect();
    let track = TrackGeometry::new(points)?;
    let records = RecordsStore::load(args.records_file, &args.drivers);
    let hud = Arc::new(HudState::new(track, args.gps_topic.clone(), args.drivers, records));

    let influx = Arc::new(InfluxWriter::new(InfluxConfig {
        enabled: args.influx_url.is_some(),
        url: args.influx_url.unwrap_or_default(),
        db: args.influx_db,
        ..Default::default()
    }));

    let gps_config = gps_ingress::GpsIngressConfig {
        host: args.mqtt_host.clone(),
        port: args.mqtt_port,
        client_id: format!("subaru-gps-{}", std::process::id()),
        gps_topic: args.gps_topic,
        events_topic_base: args.events_topic_base,
    };
    let (events_publisher, events_eventloop) = publisher::Publisher::connect(publisher::PublisherConfig {
        host: args.mqtt_host.clone(),
        port: args.mqtt_port,
        client_id: format!("subaru-events-{}", std::process::id()),
        ..Default::default()
    });
    let events_connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
    tokio::spawn(publisher::drive_eventloop(events_eventloop, events_connected));
    tokio::spawn(gps_ingress::run(gps_config, hud.clone(), Some(Arc::new(events_publisher)), influx));

    tokio::spawn(run_telemetry_loop(args.loop_config, args.catalog_path, args.mqtt_host, args.mqtt_port, args.max_spool_entries, args.spool_file, args.dtc_defs_file));

    let app = http_surface::router(http_surface::AppState { hud });
    let addr = format!("0.0.0.0:{}", args.http_port);
    info!(%addr, "http surface listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_telemetry_loop(
    config: telemetry_loop::TelemetryLoopConfig,
    catalog_path: PathBuf,
    mqtt_host: String,
    mqtt_port: u16,
    max_spool_entries: usize,
    spool_file: PathBuf,
    dtc_defs_file: Option<PathBuf>,
) {
    if let Err(err) = run_telemetry_loop_inner(config, catalog_path, mqtt_host, mqtt_port, max_spool_entries, spool_file, dtc_defs_file).await {
        error!(error = %err, "telemetry loop terminated");
    }
}

async fn run_telemetry_loop_inner(
    config: telemetry_loop::TelemetryLoopConfig,
    catalog_path: PathBuf,
    mqtt_host: String,
    mqtt_port: u16,
    max_spool_entries: usize,
    spool_file: PathBuf,
    dtc_defs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let xml = std::fs::read_to_string(&catalog_path)?;
    let catalog = ParamCatalog::load_from_str(&xml)?;
    let dtc_defs_source = dtc_defs_file.map(std::fs::read_to_string).transpose()?;
    let mut client = open_client(&config.serial_path, config.baud_rate, config.ecu_addr, config.pad_addr)?;
    let ecu = telemetry_loop::init_ecu(&mut client, &catalog, dtc_defs_source.as_deref(), &config.profile).await?;

    let (publisher, eventloop) = publisher::Publisher::connect(publisher::PublisherConfig {
        host: mqtt_host,
        port: mqtt_port,
        client_id: format!("subaru-ssm-{}", std::process::id()),
        ..Default::default()
    });
    let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
    tokio::spawn(publisher::drive_eventloop(eventloop, connected.clone()));

    let mut spool = spool::Spool::new(spool_file, max_spool_entries)?;
    let mut backoff = publisher::Backoff::new(config.backoff_min, config.backoff_max);
    let mut stats = telemetry_loop::LoopStats::default();
    let mut seq: u64 = 0;
    let mut dtc_cadence = telemetry_loop::Cadence::new(config.dtc_interval);
    let mut status_cadence = telemetry_loop::Cadence::new(config.status_interval);

    loop {
        let loop_start = std::time::Instant::now();
        let mut publish_failed = false;
        let is_connected = connected.load(std::sync::atomic::Ordering::SeqCst);
        match telemetry_loop::read_sample(&mut client, &ecu, &config) {
            Ok(values) => {
                seq += 1;
                stats.samples_total += 1;
                let sample = telemetry_loop::build_sample(seq, &ecu, &values, &config.profile);

                if is_connected {
                    let sent = telemetry_loop::flush_spool(&spool, &publisher, &config.base_topic, config.flush_per_loop).await;
                    if sent > 0 {
                        spool.drop_first(sent)?;
                    }
                    match publisher.publish_payload_and_metrics(&config.base_topic, &sample).await {
                        Ok(()) => {
                            stats.samples_ok += 1;
                            backoff.reset();
                        }
                        Err(err) => {
                            warn!(error = %err, "publish failed, spooling sample");
                            stats.mqtt_failures += 1;
                            spool.append(&sample.to_string())?;
                            stats.samples_spooled += 1;
                            publish_failed = true;
                        }
                    }
                } else {
                    spool.append(&sample.to_string())?;
                    stats.samples_spooled += 1;
                    publish_failed = true;
                }
            }
            Err(err) => {
                stats.samples_failed += 1;
                stats.last_error = err.to_string();
                error!(error = %err, "sample read failed");
            }
        }

        let cadence_now = std::time::Instant::now();
        if dtc_cadence.due(cadence_now) {
            dtc_cadence.mark_fired(cadence_now);
            match poll_dtc_and_publish(&mut client, &ecu, &publisher, &config.dtc_topic, is_connected).await {
                Ok(()) => stats.dtc_polls_ok += 1,
                Err(err) => {
                    stats.dtc_polls_failed += 1;
                    warn!(error = %err, "dtc poll failed");
                }
            }
        }
        if status_cadence.due(cadence_now) {
            status_cadence.mark_fired(cadence_now);
            let status = status_payload(&stats, is_connected, spool.depth().unwrap_or(0));
            if is_connected {
                if let Err(err) = publisher.publish_status(&config.status_topic, &status).await {
                    warn!(error = %err, "status publish failed");
                }
            }
        }

        telemetry_loop::write_state_file(&config.state_file, telemetry_loop::LoopState::Running, is_connected, spool.depth().unwrap_or(0), &stats);
        let mut sleep_for = telemetry_loop::next_sleep(config.period, loop_start.elapsed());
        if publish_failed {
            sleep_for += backoff.grow();
        }
        tokio::time::sleep(sleep_for).await;
    }
}

fn status_payload(stats: &telemetry_loop::LoopStats, connected: bool, spool_depth: usize) -> std::collections::HashMap<String, serde_json::Value> {
    let mut status = std::collections::HashMap::new();
    status.insert("ts_epoch".to_string(), json!(unix_time_now()));
    status.insert("mqtt_connected".to_string(), json!(connected));
    status.insert("spool_depth".to_string(), json!(spool_depth));
    status.insert("stats".to_string(), serde_json::to_value(stats).unwrap_or_default());
    status
}

/// Reads every address implied by the ECU's supported DTC pairs and publishes
/// a retained snapshot on the DTC topic. A missing definitions source falls
/// back to an empty catalog, which still reports bit hits as `"???"`.
async fn poll_dtc_and_publish(
    client: &mut SSM2Client<SerialLink>,
    ecu: &telemetry_loop::ActiveEcu,
    publisher: &publisher::Publisher,
    dtc_topic: &str,
    connected: bool,
) -> anyhow::Result<()> {
    let fallback_catalog = dtc::DtcCatalog::empty();
    let catalog = ecu.dtc_catalog.as_ref().unwrap_or(&fallback_catalog);

    let mut addrs: Vec<u32> = Vec::new();
    for &(curr, hist) in &ecu.dtc_pairs {
        addrs.push(curr);
        addrs.push(hist);
    }
    addrs.sort_unstable();
    addrs.dedup();

    let opts = ChunkedReadOptions {
        chunk_size: 16,
        retries: 2,
        inter_delay: Duration::from_millis(30),
        timeout: Duration::from_millis(500),
        best_effort: true,
    };
    let values = read_chunked(client, &addrs, &opts)?;
    let bytes_read = values.len();
    let bytes_total = addrs.len();

    let current = dtc::decode_hits(&ecu.dtc_pairs, &values, catalog, false);
    let historic = dtc::decode_hits(&ecu.dtc_pairs, &values, catalog, true);

    let payload = json!({
        "sys_id": ecu.identity.sys_id_hex(),
        "rom_id": ecu.identity.rom_id_hex(),
        "format": if ecu.dtc_fmt_obd2 { "obd2" } else { "subaru" },
        "pairs_total": ecu.dtc_pairs.len(),
        "bytes_read": bytes_read,
        "bytes_total": bytes_total,
        "count_current": current.len(),
        "count_historic": historic.len(),
        "current": current.iter().map(|h| json!({"addr": h.addr, "bit": h.bit, "code": h.code, "title": h.title})).collect::<Vec<_>>(),
        "historic": historic.iter().map(|h| json!({"addr": h.addr, "bit": h.bit, "code": h.code, "title": h.title})).collect::<Vec<_>>(),
        "ts": unix_time_now(),
    });

    if connected {
        publisher.publish_retained(dtc_topic, &payload).await?;
    }
    Ok(())
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn run_read_dtc(port: &str, baud: u32, ecu_addr: u8, pad_addr: u8, defs_file: &PathBuf) -> anyhow::Result<()> {
    let mut client = open_client(port, baud, ecu_addr, pad_addr)?;
    let identity = client.get_cu_data(Duration::from_secs(1))?;
    let (fmt_obd2, pairs) = dtc::enumerate_supported_dtc_addr_pairs(&identity.flagbytes);
    let symbol = dtc::symbol_for_format(fmt_obd2);
    let defs_source = std::fs::read_to_string(defs_file)?;
    let catalog = dtc::DtcCatalog::parse_defs(&defs_source, symbol)?;

    let mut addrs: Vec<u32> = Vec::new();
    for &(curr, hist) in &pairs {
        addrs.push(curr);
        addrs.push(hist);
    }
    addrs.sort_unstable();
    addrs.dedup();
    let values = client.read_multiple(&addrs, Duration::from_secs(1))?;
    let by_addr: std::collections::HashMap<u32, u8> = addrs.iter().copied().zip(values.iter().copied()).collect();

    let current = dtc::decode_hits(&pairs, &by_addr, &catalog, false);
    let historic = dtc::decode_hits(&pairs, &by_addr, &catalog, true);

    println!("Current codes:");
    for hit in &current {
        println!("  {} - {}", hit.code, hit.title);
    }
    println!("Historic codes:");
    for hit in &historic {
        println!("  {} - {}", hit.code, hit.title);
    }
    Ok(())
}


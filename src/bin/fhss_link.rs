#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use fhss_link::{
    crack_capture, dynamic_index, parse_wrapped_key, static_index, ticks_diff, Clock, Ether,
    FrequencyTable, HopScheme, InitiatorNode, LinkConfig, LinkEvent, ManualClock,
    MessageKeyVariant, Nonce, ResponderNode, SnifferNode, SNIFF_CSV_HEADER,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fhss-link",
    about = "FHSS link tools: hop schedules, handshake cracking, simulation"
)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the channel for a run of slots.
    Schedule(ScheduleArgs),
    /// Brute-force a captured (nonce, ek) pair.
    Crack(CrackArgs),
    /// Run initiator, responder and sniffer over a simulated medium.
    Simulate(SimulateArgs),
}

#[derive(Parser)]
struct ScheduleArgs {
    #[arg(long, default_value_t = 0)]
    first_slot: u32,
    #[arg(long, default_value_t = 16)]
    slots: u32,
    /// Use the dynamic scheduler with this hop seed instead of the static one.
    #[arg(long, value_parser = parse_u32)]
    hop_seed: Option<u32>,
}

#[derive(Parser)]
struct CrackArgs {
    #[arg(long)]
    nonce: String,
    #[arg(long)]
    ek: String,
    /// Quantized RSSI to try first.
    #[arg(long, allow_hyphen_values = true)]
    hint: Option<i32>,
}

#[derive(Parser)]
struct SimulateArgs {
    #[arg(long, default_value_t = 5)]
    messages: u32,
    #[arg(long, default_value_t = 2_000)]
    interval_ms: u32,
    /// RSSI at which the responder hears the initiator.
    #[arg(long, default_value_t = -30.0, allow_hyphen_values = true)]
    rssi: f32,
    /// RSSI at which the initiator hears the responder.
    #[arg(long, allow_hyphen_values = true)]
    reply_rssi: Option<f32>,
    /// RSSI at which the sniffer hears both parties.
    #[arg(long, default_value_t = -35.0, allow_hyphen_values = true)]
    sniffer_rssi: f32,
    /// Use the dynamic hop scheme.
    #[arg(long)]
    dynamic: bool,
    /// Use the rolling message-key generator.
    #[arg(long)]
    rolling: bool,
    /// Responder reveals its quantized RSSI in the reply.
    #[arg(long)]
    advertise_q: bool,
    /// Print sniffer rows as CSV.
    #[arg(long)]
    csv: bool,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Give up after this much simulated time.
    #[arg(long, default_value_t = 600_000)]
    max_ms: u32,
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => s.parse().map_err(|e: std::num::ParseIntError| e.to_string()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => LinkConfig::default(),
    };
    match cli.command {
        Command::Schedule(args) => handle_schedule(&config, args),
        Command::Crack(args) => handle_crack(&config, args),
        Command::Simulate(args) => handle_simulate(config, args),
    }
}

fn handle_schedule(config: &LinkConfig, args: ScheduleArgs) -> Result<()> {
    let table = FrequencyTable::new(config.hopping.frequencies_hz.clone())?;
    let len = table.len();
    let index_of: Box<dyn Fn(u32) -> usize> = match (args.hop_seed, &config.hopping.scheme) {
        (Some(hop_seed), _) => Box::new(move |slot| dynamic_index(hop_seed, slot, len)),
        (None, HopScheme::Static { secret_seed }) => {
            let secret_seed = *secret_seed;
            Box::new(move |slot| static_index(secret_seed, slot, len))
        }
        (None, HopScheme::Dynamic { .. }) => bail!("the dynamic scheme needs --hop-seed"),
    };
    println!("slot,start_ms,index,freq_hz");
    for slot in args.first_slot..args.first_slot.saturating_add(args.slots) {
        let index = index_of(slot);
        let start_ms = u64::from(slot) * u64::from(config.hopping.hop_interval_ms);
        println!("{},{},{},{}", slot, start_ms, index, table.frequency(index));
    }
    Ok(())
}

fn handle_crack(config: &LinkConfig, args: CrackArgs) -> Result<()> {
    let nonce: Nonce = args.nonce.parse().context("invalid --nonce")?;
    let wrapped = parse_wrapped_key(&args.ek).context("invalid --ek")?;
    let key = crack_capture(config, &nonce, &wrapped, args.hint).with_context(|| {
        format!(
            "no q in [{}, {}] unwrapped the key",
            config.sniffer.q_min, config.sniffer.q_max
        )
    })?;
    println!("q={}", key.q);
    println!("session_key={}", hex::encode(key.session_key));
    Ok(())
}

fn handle_simulate(mut config: LinkConfig, args: SimulateArgs) -> Result<()> {
    ensure!(args.interval_ms > 0, "--interval-ms must be positive");
    if args.dynamic {
        let dynamic = LinkConfig::dynamic_hopping();
        if matches!(config.hopping.scheme, HopScheme::Static { .. }) {
            config.hopping.scheme = dynamic.hopping.scheme;
        }
    }
    if args.rolling {
        config.message_key = MessageKeyVariant::Rolling;
    }
    config.handshake.advertise_q |= args.advertise_q;
    config.validate()?;

    let ether = Ether::new(ManualClock::starting_at(1_000));
    let clock = ether.clock();
    let initiator_radio = ether.attach();
    let responder_radio = ether.attach();
    let sniffer_radio = ether.attach();
    let (a, b, s) = (initiator_radio.id(), responder_radio.id(), sniffer_radio.id());
    ether.set_link_rssi(a, b, args.rssi);
    ether.set_link_rssi(b, a, args.reply_rssi.unwrap_or(args.rssi));
    ether.set_link_rssi(a, s, args.sniffer_rssi);
    ether.set_link_rssi(b, s, args.sniffer_rssi);

    let mut initiator = InitiatorNode::with_rng(
        initiator_radio,
        clock.clone(),
        config.clone(),
        StdRng::seed_from_u64(args.seed),
    )?;
    let mut responder = ResponderNode::with_rng(
        responder_radio,
        clock.clone(),
        config.clone(),
        StdRng::seed_from_u64(args.seed.wrapping_add(1)),
    )?;
    let mut sniffer = SnifferNode::new(sniffer_radio, clock.clone(), config)?;

    if args.csv {
        println!("{}", SNIFF_CSV_HEADER);
    }
    let start = clock.now_ms();
    let mut sent = 0u32;
    let mut received = 0u32;
    let mut next_send_ms = None;

    while clock.now_ms().wrapping_sub(start) < args.max_ms {
        let event = initiator.poll();
        report("initiator", &event, args.csv);
        if matches!(event, LinkEvent::Established { .. }) {
            next_send_ms = Some(clock.now_ms());
        }

        if let Some(due) = next_send_ms {
            if sent < args.messages && ticks_diff(clock.now_ms(), due) >= 0 {
                let text = format!("hello {}, t={}", sent, clock.now_ms());
                match initiator.send_message(&text) {
                    Ok(event) => report("initiator", &event, args.csv),
                    Err(e) => report("initiator", &LinkEvent::Dropped { error: e }, args.csv),
                }
                sent += 1;
                next_send_ms = Some(clock.now_ms().wrapping_add(args.interval_ms));
            }
        }

        let event = responder.poll();
        if matches!(event, LinkEvent::DataReceived { .. }) {
            received += 1;
        }
        report("responder", &event, args.csv);

        if let Some(row) = sniffer.poll() {
            if args.csv {
                println!("{}", row.to_csv_line());
            } else {
                println!(
                    "[{:>8}] sniffer    {} {} {}",
                    row.ts_ms, row.frame_type, row.status, row.details
                );
            }
        }

        if sent >= args.messages && received >= args.messages {
            break;
        }
    }

    if !args.csv {
        println!(
            "handshake attempts={} sent={} received={} elapsed_ms={}",
            initiator.attempts(),
            sent,
            received,
            clock.now_ms().wrapping_sub(start)
        );
    }
    Ok(())
}

fn report(role: &str, event: &LinkEvent, csv: bool) {
    if csv || matches!(event, LinkEvent::Idle) {
        return;
    }
    println!("{:<10} {:?}", role, event);
}

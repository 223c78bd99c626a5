use std::env;
use std::process;
use std::thread;
use std::time::Duration;

use hiface::DriverConfig;
use hiface::control::api;
use hiface::control::session::DemoSession;

const STATUS_RUN_TIME: Duration = Duration::from_millis(500);

fn print_status() -> hiface::Result<()> {
    let mut session = DemoSession::new(DriverConfig::default(), 48_000)?;
    session.start()?;
    thread::sleep(STATUS_RUN_TIME);

    let status = session.status();
    println!("Device clock : {} Hz", status.device_rate_hz);
    println!("Packets      : {}", status.packets);
    println!("Streamed     : {} bytes", status.bytes_streamed);
    println!("Peak level   : {:.2}", status.peak_level);
    println!("Tone periods : {}", status.tone_periods);
    for (card, stream) in api::list_status(session.registry()) {
        println!("{card}:");
        println!(
            "  state={} | rate={} | active={} | dma_off={} | period_off={}",
            stream.state.as_str(),
            stream
                .rate_hz
                .map(|hz| format!("{hz} Hz"))
                .unwrap_or_else(|| "unset".into()),
            if stream.position.active { "yes" } else { "no" },
            stream.position.dma_off,
            stream.position.period_off,
        );
        println!(
            "  in_flight={} | completions={} | periods={} | resubmits={} | errors={}",
            stream.in_flight, stream.completions, stream.periods, stream.resubmits, stream.errors,
        );
    }
    Ok(())
}

fn main() {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => {
                hiface::init_tracing();
                if let Err(err) = print_status() {
                    eprintln!("hifacectl: {err}");
                    process::exit(1);
                }
                return;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: hifacectl [--status]\n\nWithout arguments the interactive console launches over a simulated device."
                );
                return;
            }
            other => {
                eprintln!("hifacectl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if let Err(err) = hiface::control::ui::run() {
        eprintln!("hifacectl: {err}");
        process::exit(1);
    }
}

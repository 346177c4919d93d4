//! Terminal front-end: connect a voice session, print transcript lines as
//! they finalize, show a live level bar, hang up on Enter.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;

use voxlive::config::{get_config_path, load_config};
use voxlive::{ConnectionState, Role, Session, Voice};

#[derive(Parser)]
#[command(name = "voxlive", about = "Talk to a speech model from the terminal")]
struct Args {
    /// Voice to speak with (Aoede, Puck, Charon, Kore, Fenrir, Leda, Orus, Zephyr)
    #[arg(long)]
    voice: Option<String>,

    /// Persona system instruction override
    #[arg(long)]
    persona: Option<String>,

    /// Config file path (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let path = args.config.unwrap_or_else(get_config_path);
    let mut config = load_config(&path);
    if let Some(name) = args.voice {
        match Voice::from_name(&name) {
            Some(voice) => config.voice = voice,
            None => {
                let known: Vec<_> = Voice::ALL.iter().map(|v| v.wire_name()).collect();
                eprintln!("unknown voice '{}', expected one of: {}", name, known.join(", "));
                std::process::exit(2);
            }
        }
    }
    if let Some(persona) = args.persona {
        config.persona = persona;
    }

    let mut session = Session::new(config);
    if session.connect().is_err() {
        if let Some(error) = session.error() {
            eprintln!("{}", error);
        }
        std::process::exit(1);
    }
    println!("Connected. Speak; press Enter to hang up.");

    // Enter on stdin ends the call.
    let hang_up = Arc::new(AtomicBool::new(false));
    {
        let hang_up = hang_up.clone();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            hang_up.store(true, Ordering::SeqCst);
        });
    }

    // Render loop: transcript lines as they finalize, plus the level bar.
    let mut printed = 0usize;
    while !hang_up.load(Ordering::SeqCst) && session.state() == ConnectionState::Connected {
        printed = print_finalized(&session, printed);

        let level = session.volume() as usize;
        let bar = "#".repeat(level * 24 / 256);
        eprint!("\r[{:<24}]", bar);

        std::thread::sleep(Duration::from_millis(50));
    }
    eprintln!();

    session.disconnect();
    print_finalized(&session, printed);
    if let Some(error) = session.error() {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

/// Print log entries past `from` that are already finalized; a trailing
/// partial stays pending until its turn completes.
fn print_finalized(session: &Session, from: usize) -> usize {
    let mut printed = from;
    for message in session.transcript().iter().skip(from) {
        if message.is_partial {
            break;
        }
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "model",
        };
        println!(
            "{} {:>5}: {}",
            message.timestamp.format("%H:%M:%S"),
            who,
            message.text.trim()
        );
        printed += 1;
    }
    printed
}

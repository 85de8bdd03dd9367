// Copyright 2021-2026 The Statecore developers.
// This file is part of Statecore.

// Statecore is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Statecore is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Statecore.  If not, see <http://www.gnu.org/licenses/>.

//! Execution event capture utility: inspects and tails event ring files.

use std::{
    fs::File,
    process,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use clap::{App, Arg};
use event_ring::{EventRing, MapMode, NextResult, DEFAULT_TEST_RING_PATH};

static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Well-known ring names and where their files live by default.
fn default_path_for_name(name: &str) -> Option<String> {
    match name {
        "test" => Some(
            std::env::var("EVENT_RING_FILE").unwrap_or_else(|_| DEFAULT_TEST_RING_PATH.to_string()),
        ),
        _ => None,
    }
}

fn print_header(path: &str, ring: &EventRing) {
    println!("{path}:");
    println!("  content type       {}", ring.content_type().name());
    let hash = ring
        .schema_hash()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    println!("  schema hash        {hash}");
    let size = ring.size();
    println!("  descriptors        {}", size.descriptor_capacity);
    println!("  payload buffer     {} bytes", size.payload_buf_size);
    println!("  context area       {} bytes", size.context_area_size);
    println!("  last seqno         {}", ring.last_seqno());
}

fn hexdump(bytes: &[u8]) {
    for (i, line) in bytes.chunks(16).enumerate() {
        let hex = line
            .iter()
            .map(|b| format!("{b:02x} "))
            .collect::<String>();
        let ascii = line
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    *b as char
                } else {
                    '.'
                }
            })
            .collect::<String>();
        println!("    {:08x}  {hex:<48} {ascii}", i * 16);
    }
}

fn print_event(path: &str, ring: &EventRing, event: &event_ring::EventDescriptor, hex: bool) {
    let secs = event.epoch_nanos / 1_000_000_000;
    let nanos = event.epoch_nanos % 1_000_000_000;
    println!(
        "{path}: seqno {} type {} time {secs}.{nanos:09} payload {} bytes{}",
        event.seqno,
        event.event_type,
        event.payload_size,
        if event.inline_payload != 0 { " (inline)" } else { "" }
    );
    if hex {
        let payload = ring.payload_peek(event).to_vec();
        if ring.payload_check(event) {
            hexdump(&payload);
        } else {
            println!("    <payload expired>");
        }
    }
}

fn run() -> Result<(), String> {
    env_logger::init();
    let matches = App::new("eventcap")
        .about("Execution event capture utility")
        .arg(
            Arg::with_name("header")
                .long("header")
                .help("print event ring file header and exit"),
        )
        .arg(
            Arg::with_name("follow")
                .short("f")
                .long("follow")
                .help("stream events to stdout, as in tail -f"),
        )
        .arg(
            Arg::with_name("hex")
                .short("H")
                .long("hex")
                .help("hexdump event payloads"),
        )
        .arg(
            Arg::with_name("start-seqno")
                .long("start-seqno")
                .takes_value(true)
                .help("force iteration to start from this sequence number"),
        )
        .arg(
            Arg::with_name("rings")
                .multiple(true)
                .help("event ring paths or well-known names"),
        )
        .get_matches();

    let mut paths: Vec<String> = match matches.values_of("rings") {
        Some(values) => values
            .map(|v| default_path_for_name(v).unwrap_or_else(|| v.to_string()))
            .collect(),
        None => Vec::new(),
    };
    if paths.is_empty() {
        paths.push(
            default_path_for_name("test").expect("the test ring always has a default path"),
        );
    }

    let mut rings = Vec::new();
    for path in &paths {
        let file = File::open(path).map_err(|e| format!("cannot open `{path}`: {e}"))?;
        let ring = EventRing::map(&file, MapMode::ReadOnly, 0)
            .map_err(|e| format!("cannot map `{path}`: {e}"))?;
        rings.push((path.clone(), ring));
    }

    if matches.is_present("header") {
        for (path, ring) in &rings {
            print_header(path, ring);
        }
        return Ok(());
    }

    let follow = matches.is_present("follow");
    let hex = matches.is_present("hex");
    let start_seqno: Option<u64> = match matches.value_of("start-seqno") {
        Some(v) => Some(
            v.parse()
                .map_err(|e| format!("bad --start-seqno value `{v}`: {e}"))?,
        ),
        None => None,
    };

    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let mut iters: Vec<_> = rings.iter().map(|(_, ring)| ring.iterator()).collect();
    for iter in iters.iter_mut() {
        match start_seqno {
            Some(seqno) => iter.set_seqno(seqno),
            // Without an explicit start, dump everything still in the ring.
            None => iter.set_seqno(1),
        }
    }

    while !SHOULD_EXIT.load(Ordering::SeqCst) {
        let mut idle = true;
        for (index, iter) in iters.iter_mut().enumerate() {
            let (path, ring) = &rings[index];
            match iter.try_next() {
                NextResult::Ready(event) => {
                    print_event(path, ring, &event, hex);
                    idle = false;
                }
                NextResult::Gap => {
                    eprintln!(
                        "{path}: fell behind, resuming at seqno {}",
                        iter.read_last_seqno() + 1
                    );
                    idle = false;
                }
                NextResult::NotReady => (),
            }
        }
        if idle {
            if !follow {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("eventcap: {err}");
        process::exit(1);
    }
}

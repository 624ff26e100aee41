// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side proxy process: watches the guest directories for channel
//! sockets and relays each framed session arriving on them to the TCP
//! service on the host's loopback.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

use serialtun::logger;
use serialtun::HostManager;

const DEFAULT_ROOT: &str = "/tmp/qpid";
const DEFAULT_PORT: u16 = 5672;
// Seconds between the enumeration passes that retry failed endpoint opens.
const RECONNECT_PERIOD_SECS: u32 = 5;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sigint(_signum: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn setup_signals() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);

        // A peer closing mid-write must surface as EPIPE, not kill us.
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGPIPE);
        libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
    }
}

fn usage(argv0: &str) {
    println!("usage: {} [guest_dir [service_port [log_level]]]", argv0);
    println!("where");
    println!(" guest_dir    - path containing directories of serial endpoints to guests.");
    println!("                Default = {}", DEFAULT_ROOT);
    println!(" service_port - the service port on localhost proxied to the guests.");
    println!("                Default = {}", DEFAULT_PORT);
    println!(" log_level    - log verbosity setting.");
    println!("                One of {}.", logger::LEVEL_NAMES.join(", "));
    println!("                Default = INFO");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if let Some(arg) = args.get(1) {
        if matches!(arg.as_str(), "-h" | "--h" | "-help" | "--help") {
            usage(&args[0]);
            return;
        }
    }

    let root = PathBuf::from(args.get(1).map(String::as_str).unwrap_or(DEFAULT_ROOT));
    let service_port: u16 = match args.get(2) {
        Some(arg) => match arg.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("Specify service port in range 1..65535");
                exit(1);
            }
        },
        None => DEFAULT_PORT,
    };
    let level = match args.get(3) {
        Some(arg) => match logger::parse_level(arg) {
            Some(level) => level,
            None => {
                eprintln!(
                    "Unknown log level. Use one of: {}",
                    logger::LEVEL_NAMES.join(" ")
                );
                exit(1);
            }
        },
        None => log::LevelFilter::Info,
    };
    logger::init(level);

    setup_signals();

    info!(
        "Host proxy start: guest directory: {}, service port: {}",
        root.display(),
        service_port
    );

    let mut manager = HostManager::new(root.clone(), service_port);

    while RUNNING.load(Ordering::SeqCst) {
        // Find guests and their channels, retrying failed endpoint opens.
        manager.enumerate_guest_dirs(true);

        for _ in 0..RECONNECT_PERIOD_SECS {
            if !RUNNING.load(Ordering::SeqCst) {
                break;
            }

            manager.poll_one_second();

            if RUNNING.load(Ordering::SeqCst) {
                manager.enumerate_guest_dirs(false);
            }
        }
    }

    info!(
        "Host proxy stop: guest directory: {}, service port: {}",
        root.display(),
        service_port
    );
}

// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-side proxy process: offers a loopback TCP port to guest-local
//! clients and tunnels each connection to the host proxy over one of the
//! serial endpoints found under the root directory.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

use serialtun::channel::defs::CONNECT_TIMEOUT_TICKS;
use serialtun::logger;
use serialtun::GuestManager;

const DEFAULT_ROOT: &str = "/dev/virtio-ports";
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
    println!("usage: {} [host_dir [listen_port [log_level]]]", argv0);
    println!("where");
    println!(" host_dir     - path containing serial endpoints to the host.");
    println!("                Default = {}", DEFAULT_ROOT);
    println!(" listen_port  - the local port offered to clients of the tunnel.");
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
    let listen_port: u16 = match args.get(2) {
        Some(arg) => match arg.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("Specify listen port in range 1..65535");
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
        "Guest proxy start: host directory: {}, listen port: {}",
        root.display(),
        listen_port
    );

    let mut manager = match GuestManager::new(root.clone(), listen_port, CONNECT_TIMEOUT_TICKS) {
        Ok(manager) => manager,
        Err(err) => {
            error!("Guest proxy startup failed: {:?}", err);
            exit(1);
        }
    };

    while RUNNING.load(Ordering::SeqCst) {
        // Find endpoints, retrying the ones that failed to open before.
        if let Err(err) = manager.enumerate_endpoints(true) {
            error!("Endpoint enumeration failed: {:?}", err);
            exit(1);
        }

        for _ in 0..RECONNECT_PERIOD_SECS {
            if !RUNNING.load(Ordering::SeqCst) {
                break;
            }

            manager.poll_one_second();

            if RUNNING.load(Ordering::SeqCst) {
                if let Err(err) = manager.enumerate_endpoints(false) {
                    error!("Endpoint enumeration failed: {:?}", err);
                    exit(1);
                }
                manager.clock_tick();
            }
        }
    }

    info!(
        "Guest proxy stop: host directory: {}, listen port: {}",
        root.display(),
        listen_port
    );
}

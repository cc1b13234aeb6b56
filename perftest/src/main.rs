
use log::{error, LevelFilter};
use netengine_net::EndpointSettings;
use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

fn main() {
    let mut clog = colog::default_builder();

    #[cfg(debug_assertions)]
    clog.filter_level(LevelFilter::Debug);

    #[cfg(not(debug_assertions))]
    clog.filter_level(LevelFilter::Warn);

    clog.init();

    let args: Vec<String> = env::args().collect();

    // 2nd command line arg is the name of the environment
    let environment = match args.get(2) {
        Some(s) => s.as_str(),
        None => "dev",
    };

    // Merge Settings, Settings.<environment> and NETENGINE_* variables
    let settings = match EndpointSettings::load(environment) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Perftest: Failed to load settings: {err}");
            return;
        }
    };

    // Handle SIGTERM by setting the stop_signal boolean
    let stop_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = stop_signal.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_signal.store(true, Ordering::Relaxed)) {
        error!("Perftest: Failed to install Ctrl-C handler: {err}");
    }

    match args.get(1) {
        Some(s) if s == "tcp" => tcp_test::run_test(&settings, &stop_signal),
        Some(s) if s == "udp" => udp_test::run_test(&settings, &stop_signal),
        Some(_) | None => {
            println!("Pass 'tcp' or 'udp' on the command line, optionally followed by an environment name");
        }
    }
}

/// Formats a whole number with thousands separators
pub(crate) fn thousands(number: f64) -> String {
    let digits = (number.floor() as u64).to_string();
    digits
        .as_bytes()
        .rchunks(3)
        .rev()
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect::<Vec<&str>>()
        .join(",")
}

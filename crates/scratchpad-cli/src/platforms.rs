//! Platforms command: list launchable platforms and their worker binaries.

use scratchpad_core::ScratchpadConfig;
use scratchpad_core::ipc::ProcessLauncher;
use scratchpad_core::platform::Platform;

use crate::colors;

pub fn execute() {
    let config = ScratchpadConfig::from_env();
    let launcher = ProcessLauncher::new(config.supervisor.worker_path.clone());
    let host = Platform::host();

    for platform in Platform::known() {
        let marker = if platform == host { "*" } else { " " };
        let worker = match launcher.find_worker_binary(&platform) {
            Ok(path) => format!("{}{}{}", colors::DIM, path.display(), colors::RESET),
            Err(_) => format!("{}worker not installed{}", colors::YELLOW, colors::RESET),
        };
        println!(
            "{} {:<14} {:<20} {}",
            marker,
            platform.short_id(),
            platform.name,
            worker
        );
    }
}

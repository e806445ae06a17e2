pub mod daemon;
pub mod log;
pub mod update;

use anssl_agent::supervisor;

pub async fn handle_stop() -> anyhow::Result<()> {
    if !supervisor::is_running() {
        println!("anssl is not running");
        return Ok(());
    }
    supervisor::stop_daemon().await?;
    println!("anssl stopped");
    Ok(())
}

pub fn handle_status() -> anyhow::Result<()> {
    match supervisor::read_pid() {
        Some(pid) if supervisor::process_alive(pid) => {
            println!("anssl is running (pid {pid})");
        }
        Some(pid) => {
            println!("anssl is not running (stale pid file, pid {pid})");
        }
        None => {
            println!("anssl is not running");
        }
    }
    Ok(())
}

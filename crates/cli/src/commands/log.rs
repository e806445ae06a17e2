use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use anssl_agent::supervisor;

/// Print the log file; with `follow`, keep polling for appended output the
/// way `tail -f` does.
pub async fn handle_log(config_path: &str, follow: bool) -> anyhow::Result<()> {
    let path = supervisor::log_file_path(config_path);
    if !path.exists() {
        println!("no log file at {}", path.display());
        return Ok(());
    }

    let mut file = std::fs::File::open(&path)?;
    let mut stdout = std::io::stdout();

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    stdout.write_all(&buffer)?;
    stdout.flush()?;

    if !follow {
        return Ok(());
    }

    let mut offset = file.seek(SeekFrom::End(0))?;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let len = std::fs::metadata(&path)?.len();
        if len < offset {
            // Rotated or truncated; start over from the top.
            offset = 0;
        }
        if len == offset {
            continue;
        }

        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)?;
        stdout.write_all(&chunk)?;
        stdout.flush()?;
        offset = len;
    }
}

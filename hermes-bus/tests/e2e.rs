use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_broker_info_and_exit() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("hermes-bus");

    let (mut broker, mut broker_stdout) = spawn_broker(&binary).await?;
    let addr = read_broker_addr(&mut broker_stdout).await?;

    // Keep the pipe drained so broker logging never blocks.
    let broker_log_task = tokio::spawn(async move {
        let mut line = String::new();
        while broker_stdout.read_line(&mut line).await.unwrap_or(0) > 0 {
            line.clear();
        }
    });

    let catalog = run_client(&binary, &["info"], &addr).await?;
    assert_eq!(catalog.trim(), "{}");

    let missing = client_command(&binary, &["info", "--name", "Rohan"], &addr)
        .output()
        .await?;
    assert!(!missing.status.success(), "lookup of a missing service must fail");

    let farewell = run_client_exit(&binary, &addr).await?;
    assert_eq!(farewell.trim(), "Bye!");

    let status = timeout(READ_TIMEOUT, broker.wait())
        .await
        .context("broker did not exit after Exit")??;
    assert!(status.success(), "broker exited with {status}");
    let _ = broker_log_task.await;

    Ok(())
}

async fn spawn_broker(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("broker")
        .arg("--port")
        .arg("0")
        .arg("--no-beacon")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn broker")?;
    let stdout = child
        .stdout
        .take()
        .context("broker stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_broker_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    const BANNER: &str = "broker listening on ";

    loop {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("timed out waiting for broker banner")??;
        if read == 0 {
            return Err(anyhow!("broker exited before announcing its address"));
        }
        let Some(start) = line.find(BANNER) else {
            continue;
        };
        let addr: String = line[start + BANNER.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ':')
            .collect();
        if !addr.contains(':') {
            return Err(anyhow!("broker banner missing socket: {}", line.trim()));
        }
        return Ok(addr);
    }
}

fn client_command(binary: &Path, args: &[&str], broker: &str) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--broker")
        .arg(broker)
        .args(args)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stderr(Stdio::null());
    cmd
}

async fn run_client(binary: &Path, args: &[&str], broker: &str) -> Result<String> {
    let output = timeout(READ_TIMEOUT, client_command(binary, args, broker).output())
        .await
        .context("client timed out")??;
    if !output.status.success() {
        return Err(anyhow!("client {args:?} exited with {}", output.status));
    }
    Ok(String::from_utf8(output.stdout)?)
}

async fn run_client_exit(binary: &Path, broker: &str) -> Result<String> {
    run_client(binary, &["exit", "--target", broker], broker).await
}

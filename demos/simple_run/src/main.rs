use childproc::{LaunchSpec, OutputKind, OutputSink, Process, probe_capabilities};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("childproc=info")),
        )
        .init();

    // Probe once and reuse for every launch.
    let caps = probe_capabilities();

    let command = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let command = if command.is_empty() {
        "echo hello; echo oops >&2".to_string()
    } else {
        command
    };

    let spec = LaunchSpec::builder()
        .command(command)
        .timeout(Duration::from_secs(30)) // Kill it after 30 seconds
        .idle_timeout(Duration::from_secs(10)) // Or after 10 silent seconds
        .build()?;

    let mut process = Process::new(spec, caps)?;

    // Echo output as it arrives.
    let sink: Box<dyn OutputSink> = Box::new(|kind: OutputKind, data: &[u8]| {
        let text = String::from_utf8_lossy(data);
        match kind {
            OutputKind::Out => print!("{text}"),
            OutputKind::Err => eprint!("{text}"),
        }
    });

    let code = process.run(Some(sink))?;
    tracing::info!(
        code,
        meaning = process.exit_code_text()?.unwrap_or_default(),
        "Command finished"
    );

    Ok(())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use console::style;
use dialoguer::{theme::ColorfulTheme, Input};
use indicatif::{ProgressBar, ProgressStyle};
use peerchat_core::{
    ChatOrigin, ChatSession, ConnectionState, FileHeader, IrohPeer, MemoryNetwork, PeerSession,
    ReceivedFile, SendReport, TransferConfig, UiEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Environment variable naming the directory received files are saved to
pub const DOWNLOAD_DIR_ENV: &str = "PEERCHAT_DOWNLOAD_DIR";

/// Something typed at the chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Send(Option<PathBuf>),
    Retry,
    Hangup,
    Mute,
    Camera,
    Quit,
    Help,
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Command::Empty;
    }
    // A leading double slash sends the rest as chat
    if let Some(text) = line.strip_prefix("//") {
        return Command::Chat(format!("/{}", text));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Chat(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "send" if arg.is_empty() => Command::Send(None),
        "send" => Command::Send(Some(expand_path(arg))),
        "retry" => Command::Retry,
        "hangup" => Command::Hangup,
        "mute" => Command::Mute,
        "camera" => Command::Camera,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        other => Command::Unknown(other.to_string()),
    }
}

fn expand_path(input: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(input).to_string())
}

/// Pick the download directory: the flag, then the environment, then `cwd`
pub fn resolve_download_dir(flag: Option<PathBuf>, env: Option<String>, cwd: PathBuf) -> PathBuf {
    match (flag, env) {
        (Some(dir), _) => dir,
        (None, Some(dir)) if !dir.trim().is_empty() => expand_path(dir.trim()),
        _ => cwd,
    }
}

fn download_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    Ok(resolve_download_dir(
        flag,
        std::env::var(DOWNLOAD_DIR_ENV).ok(),
        std::env::current_dir()?,
    ))
}

/// Reduce a name chosen by the remote peer to a bare file name
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => "download".to_string(),
        name => name.to_string(),
    }
}

/// `dir/name`, or `dir/name (n).ext` if that is taken
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Write a received file into `dir`, never overwriting an existing one
pub async fn save_received(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = unique_path(dir, &sanitize_file_name(&file.name));
    tokio::fs::write(&path, &file.data).await?;
    debug!(path = %path.display(), bytes = file.data.len(), "saved received file");
    Ok(path)
}

/// Describe a local file for sending
pub async fn file_header(path: &Path) -> Result<FileHeader> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        anyhow::bail!("Not a file: {}", path.display());
    }

    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    Ok(FileHeader::new(name, metadata.len(), mime))
}

pub async fn run_listen(download_dir_flag: Option<PathBuf>) -> Result<()> {
    let download_dir = download_dir(download_dir_flag)?;
    println!("\n{} Starting peer...", style("⚡").cyan());

    let (peer, session_events) = IrohPeer::bind().await?;
    let (session, ui) = ChatSession::new(peer, session_events, TransferConfig::default())?;

    println!(
        "{} Share this ticket with your peer:\n",
        style("⚡").cyan()
    );
    println!("  {}", style(session.local_id()).green());
    println!();
    println!(
        "  {}",
        style("Peer runs: peerchat connect <ticket>").dim()
    );
    println!();
    println!("{}", style("Waiting for a peer to connect...").dim());

    let session = chat_loop(session, ui, download_dir).await?;
    session.into_peer().shutdown().await?;
    Ok(())
}

pub async fn run_connect(ticket: Option<String>, download_dir_flag: Option<PathBuf>) -> Result<()> {
    let download_dir = download_dir(download_dir_flag)?;

    // Interactive ticket input if not provided
    let ticket = match ticket {
        Some(t) => t,
        None => Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Enter the peer's ticket")
            .interact_text()?,
    };

    let (peer, session_events) = IrohPeer::bind().await?;
    let (mut session, ui) = ChatSession::new(peer, session_events, TransferConfig::default())?;

    session.connect(&ticket)?;
    let session = chat_loop(session, ui, download_dir).await?;
    session.into_peer().shutdown().await?;
    Ok(())
}

/// Run two peers in this process: alice says hello and sends a file to bob
pub async fn run_demo(path: Option<PathBuf>) -> Result<()> {
    let network = MemoryNetwork::new();
    let (alice_peer, alice_events) = network.join("alice");
    let (bob_peer, bob_events) = network.join("bob");

    let (mut alice, mut alice_ui) =
        ChatSession::new(alice_peer, alice_events, TransferConfig::default())?;
    let (mut bob, mut bob_ui) = ChatSession::new(bob_peer, bob_events, TransferConfig::default())?;
    let mut alice_view = Console::new("alice");
    let mut bob_view = Console::new("bob");

    alice.connect("bob")?;
    while alice.state() != ConnectionState::Connected || bob.state() != ConnectionState::Connected {
        tokio::select! {
            _ = alice.step() => {}
            _ = bob.step() => {}
        }
        alice_view.drain(&mut alice_ui);
        bob_view.drain(&mut bob_ui);
        if alice.state() == ConnectionState::Error {
            anyhow::bail!("Demo peers failed to connect");
        }
    }

    alice.send_chat("hello from alice")?;
    bob.send_chat("hi alice, send it over")?;

    let (header, data) = match path {
        Some(path) => {
            let header = file_header(&path).await?;
            (header, Bytes::from(tokio::fs::read(&path).await?))
        }
        None => {
            let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
            (
                FileHeader::new("demo.bin", data.len() as u64, "application/octet-stream"),
                Bytes::from(data),
            )
        }
    };
    let expected = data.len();
    let upload = alice.upload()?;
    let sending = tokio::spawn(upload.run(header, std::io::Cursor::new(data)));

    let received = loop {
        tokio::select! {
            _ = alice.step() => {}
            _ = bob.step() => {}
        }
        alice_view.drain(&mut alice_ui);
        if let Some(file) = bob_view.drain(&mut bob_ui) {
            break file;
        }
        if bob.state() != ConnectionState::Connected {
            anyhow::bail!("Demo connection dropped before the file arrived");
        }
    };
    let report = sending.await??;

    alice.hangup();
    while bob.state() == ConnectionState::Connected {
        bob.step().await;
    }
    alice_view.drain(&mut alice_ui);
    bob_view.drain(&mut bob_ui);

    if received.data.len() != expected {
        anyhow::bail!(
            "Demo file arrived with {} bytes, expected {}",
            received.data.len(),
            expected
        );
    }
    println!(
        "\n{} Sent {} in {} chunks ({} pauses)",
        style("✓").green().bold(),
        format_bytes(report.bytes_sent),
        report.chunks,
        report.pauses
    );
    Ok(())
}

/// Drive `session` from stdin until the user quits or the input ends
async fn chat_loop<P: PeerSession>(
    mut session: ChatSession<P>,
    mut ui: mpsc::UnboundedReceiver<UiEvent>,
    download_dir: PathBuf,
) -> Result<ChatSession<P>> {
    print_help();
    let mut view = Console::new("");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Command::Empty => {}
                    Command::Chat(text) => {
                        if let Err(e) = session.send_chat(&text) {
                            view.error(&e.to_string());
                        }
                    }
                    Command::Send(None) => view.error("Usage: /send PATH"),
                    Command::Send(Some(path)) => {
                        match start_upload(&session, &path, done_tx.clone()).await {
                            Ok(header) => view.sending(&header),
                            Err(e) => view.error(&e.to_string()),
                        }
                    }
                    Command::Retry => {
                        if let Err(e) = session.retry() {
                            view.error(&e.to_string());
                        }
                    }
                    Command::Hangup => session.hangup(),
                    Command::Mute => match session.media_mut().toggle_mute() {
                        Ok(muted) => view.notice(if muted { "Muted" } else { "Unmuted" }),
                        Err(e) => view.error(&format!("No media call: {}", e)),
                    },
                    Command::Camera => match session.media_mut().toggle_camera() {
                        Ok(off) => view.notice(if off { "Camera off" } else { "Camera on" }),
                        Err(e) => view.error(&format!("No media call: {}", e)),
                    },
                    Command::Help => print_help(),
                    Command::Unknown(name) => view.error(&format!("Unknown command /{}", name)),
                    Command::Quit => break,
                }
            }
            alive = session.step() => {
                if !alive {
                    break;
                }
            }
            Some(result) = done_rx.recv() => view.upload_finished(result),
        }

        if let Some(file) = view.drain(&mut ui) {
            match save_received(&download_dir, &file).await {
                Ok(path) => view.saved(&file, &path),
                Err(e) => view.error(&format!("Could not save {}: {}", file.name, e)),
            }
        }
    }

    Ok(session)
}

async fn start_upload<P: PeerSession>(
    session: &ChatSession<P>,
    path: &Path,
    done: mpsc::UnboundedSender<peerchat_core::Result<SendReport>>,
) -> Result<FileHeader> {
    let upload = session.upload()?;
    let header = file_header(path).await?;
    let file = tokio::fs::File::open(path).await?;

    let task_header = header.clone();
    tokio::spawn(async move {
        let _ = done.send(upload.run(task_header, file).await);
    });
    Ok(header)
}

fn print_help() {
    println!(
        "{}",
        style("Type to chat. Commands: /send PATH, /retry, /hangup, /mute, /camera, /quit").dim()
    );
}

/// Renders UI events for one side of a conversation
struct Console {
    label: String,
    send_bar: Option<ProgressBar>,
    recv_bar: Option<ProgressBar>,
}

impl Console {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            send_bar: None,
            recv_bar: None,
        }
    }

    fn prefix(&self) -> String {
        if self.label.is_empty() {
            String::new()
        } else {
            format!("{} ", style(format!("[{}]", self.label)).magenta())
        }
    }

    /// Show every pending event. Returns the last file that finished arriving.
    fn drain(&mut self, ui: &mut mpsc::UnboundedReceiver<UiEvent>) -> Option<ReceivedFile> {
        let mut ready = None;
        while let Ok(event) = ui.try_recv() {
            if let Some(file) = self.show(event) {
                ready = Some(file);
            }
        }
        ready
    }

    fn show(&mut self, event: UiEvent) -> Option<ReceivedFile> {
        let prefix = self.prefix();
        match event {
            UiEvent::Status { state, message } => {
                let marker = match state {
                    ConnectionState::Connected => style("●").green(),
                    ConnectionState::Connecting => style("●").yellow(),
                    ConnectionState::Error => style("●").red(),
                    ConnectionState::Disconnected | ConnectionState::Closed => style("●").dim(),
                };
                println!("{}{} {}", prefix, marker, message);
                if matches!(state, ConnectionState::Error | ConnectionState::Closed) {
                    self.abandon_bars();
                }
            }
            UiEvent::Chat { text, origin } => {
                let who = match origin {
                    ChatOrigin::Local => style("you").cyan(),
                    ChatOrigin::Remote => style("peer").green(),
                };
                println!("{}{}: {}", prefix, who, text);
            }
            UiEvent::SendProgress(pct) => {
                let bar = self
                    .send_bar
                    .get_or_insert_with(|| percent_bar("sending"));
                bar.set_position(pct as u64);
                if pct >= 100 {
                    bar.finish();
                    self.send_bar = None;
                }
            }
            UiEvent::ReceiveProgress(pct) => {
                self.recv_bar
                    .get_or_insert_with(|| percent_bar("receiving"))
                    .set_position(pct as u64);
            }
            UiEvent::FileReady(file) => {
                if let Some(bar) = self.recv_bar.take() {
                    bar.finish();
                }
                println!(
                    "{}{} Received {} ({}, {})",
                    prefix,
                    style("✓").green().bold(),
                    style(&file.name).cyan(),
                    format_bytes(file.data.len() as u64),
                    file.mime
                );
                return Some(file);
            }
            UiEvent::Diagnostic(diagnostic) => {
                println!("{}{} {}", prefix, style("⚠").yellow(), diagnostic);
            }
            UiEvent::SessionNotice(message) => {
                println!("{}{}", prefix, style(message).dim());
            }
        }
        None
    }

    fn sending(&self, header: &FileHeader) {
        println!(
            "{}{} Sending {} ({}, {})",
            self.prefix(),
            style("⚡").cyan(),
            style(&header.name).green(),
            format_bytes(header.size),
            header.mime
        );
    }

    fn upload_finished(&mut self, result: peerchat_core::Result<SendReport>) {
        match result {
            Ok(report) => println!(
                "{}{} Sent {} in {} chunks",
                self.prefix(),
                style("✓").green().bold(),
                format_bytes(report.bytes_sent),
                report.chunks
            ),
            Err(e) => {
                if let Some(bar) = self.send_bar.take() {
                    bar.abandon();
                }
                warn!(error = %e, "upload ended early");
                self.error(&format!("Send failed: {}", e));
            }
        }
    }

    fn saved(&self, file: &ReceivedFile, path: &Path) {
        println!(
            "{}  Saved {} to {}",
            self.prefix(),
            style(&file.name).cyan(),
            style(path.display()).cyan()
        );
    }

    fn notice(&self, message: &str) {
        println!("{}{}", self.prefix(), style(message).dim());
    }

    fn error(&self, message: &str) {
        eprintln!("{}{} {}", self.prefix(), style("✗").red(), message);
    }

    fn abandon_bars(&mut self) {
        for bar in [self.send_bar.take(), self.recv_bar.take()].into_iter().flatten() {
            bar.abandon();
        }
    }
}

fn percent_bar(action: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    // Falls back to the default look if the template is rejected
    if let Ok(template) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
    {
        pb.set_style(template.progress_chars("=>-"));
    }
    pb.set_message(action.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

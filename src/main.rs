use clap::Parser;
use color_eyre::Section;
use color_eyre::eyre::{Report, Result, WrapErr};
use kmsgrab::capture::{CaptureError, KmsSource, SocketSource};
use kmsgrab::config::Config;
use kmsgrab::kms::{Card, default_device_path};
use kmsgrab::present::window::WindowError;
use kmsgrab::present::{self, FrameSource};
use kmsgrab::{logging, transfer};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::info;

const PRIVILEGE_HINT: &str = "run as root or grant the binary CAP_SYS_ADMIN (setcap cap_sys_admin+ep)";

#[derive(Parser)]
#[command(name = "kmsgrab")]
#[command(about = "Show the framebuffer a KMS display controller is scanning out")]
#[command(version)]
struct Cli {
    /// DRM device node, defaults to the first /dev/dri/card*
    #[arg(long)]
    device: Option<PathBuf>,

    /// Window width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Window height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Open a borderless fullscreen window
    #[arg(long)]
    fullscreen: bool,

    /// Capture the cursor plane instead of the desktop
    #[arg(long)]
    cursor: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the device's display resources and exit
    #[arg(long, conflicts_with_all = ["serve", "connect"])]
    list: bool,

    /// Hand the scanout buffer to every client connecting to this socket
    #[arg(long, value_name = "SOCKET", conflicts_with = "connect")]
    serve: Option<PathBuf>,

    /// Show the buffer sent by a `--serve` process
    #[arg(long, value_name = "SOCKET")]
    connect: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        config.window.fullscreen |= self.fullscreen;
        config.capture.prefer_cursor |= self.cursor;
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    logging::init(&config.log.filter);

    if let Some(socket) = &cli.connect {
        let stream = UnixStream::connect(socket)
            .wrap_err_with(|| format!("Unable to connect to {}", socket.display()))?;
        let source = SocketSource::receive(&stream).map_err(capture_report)?;
        return show(source, &config);
    }

    let path = config.device.clone().unwrap_or_else(default_device_path);
    let card = Card::open(&path)
        .map_err(|err| capture_report(err.into()))
        .wrap_err("Unable to open the display device")?;

    if cli.list {
        let summary = card
            .resources()
            .map_err(|err| capture_report(err.into()))
            .wrap_err_with(|| format!("Unable to read resources of {}", path.display()))?;
        print!("{summary}");
        return Ok(());
    }

    let source = KmsSource::with_classifier(
        card,
        config.cursor_size(),
        config.capture.prefer_cursor,
    );
    match &cli.serve {
        Some(socket) => serve(socket, source),
        None => show(source, &config),
    }
}

fn show<S: FrameSource>(source: S, config: &Config) -> Result<()> {
    present::run(source, config.window_options()).map_err(window_report)?;
    info!("Bye");
    Ok(())
}

fn serve<S: FrameSource>(socket: &Path, mut source: S) -> Result<()> {
    let listener = UnixListener::bind(socket)
        .wrap_err_with(|| format!("Unable to listen on {}", socket.display()))?;
    info!("Serving the scanout buffer on {}", socket.display());
    transfer::serve(&listener, &mut source, None)?;
    Ok(())
}

fn capture_report(err: CaptureError) -> Report {
    let denied = err.is_permission_denied();
    with_privilege_hint(Report::new(err), denied)
}

fn window_report(err: WindowError) -> Report {
    let denied = match &err {
        WindowError::Present(present) => present
            .capture_error()
            .is_some_and(CaptureError::is_permission_denied),
        _ => false,
    };
    with_privilege_hint(Report::new(err), denied)
}

fn with_privilege_hint(report: Report, denied: bool) -> Report {
    if denied {
        report.suggestion(PRIVILEGE_HINT)
    } else {
        report
    }
}

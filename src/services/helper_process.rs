use std::path::{Path, PathBuf};
use std::process::Stdio;

use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::errors::{CoreError, Result};
use crate::models::UNKNOWN_VERSION;
use crate::services::directory_resolver::normalize_game_name;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HelperKind {
    Generic,
    Gofile,
    Torrent,
    GameHandler,
}

impl HelperKind {
    pub fn name(self) -> &'static str {
        match self {
            HelperKind::Generic => "AscendaraDownloader",
            HelperKind::Gofile => "AscendaraGofileHelper",
            HelperKind::Torrent => "AscendaraTorrentHandler",
            HelperKind::GameHandler => "AscendaraGameHandler",
        }
    }

    /// Torrent source wins over link shape.
    pub fn for_link(link: &str, torrent_source: bool) -> Self {
        if torrent_source {
            HelperKind::Torrent
        } else if link.contains("gofile.io") {
            HelperKind::Gofile
        } else {
            HelperKind::Generic
        }
    }

    /// Matches `AscendaraDownloader`, `AscendaraDownloader.exe`,
    /// `/opt/x/AscendaraDownloader.py` and friends.
    pub fn from_program(program: &str) -> Option<Self> {
        let file = program.rsplit(|ch: char| ch == '/' || ch == '\\').next()?;
        let lower = file.to_ascii_lowercase();
        let stem = lower
            .strip_suffix(".exe")
            .or_else(|| lower.strip_suffix(".py"))
            .unwrap_or(&lower);
        [
            HelperKind::Generic,
            HelperKind::Gofile,
            HelperKind::Torrent,
            HelperKind::GameHandler,
        ]
        .into_iter()
        .find(|kind| kind.name().eq_ignore_ascii_case(stem))
    }

    pub fn is_downloader(self) -> bool {
        !matches!(self, HelperKind::GameHandler)
    }
}

fn flag(value: bool) -> String {
    value.to_string()
}

fn version_arg(version: Option<&str>) -> String {
    match version.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => UNKNOWN_VERSION.to_string(),
    }
}

/// gofile links arrive without a scheme.
pub fn helper_link(kind: HelperKind, link: &str) -> String {
    if kind == HelperKind::Gofile && !link.starts_with("http://") && !link.starts_with("https://") {
        format!("https://{link}")
    } else {
        link.to_string()
    }
}

/// Positional arguments of a fresh download.
#[derive(Clone, Debug)]
pub struct DownloadArgs<'a> {
    pub link: &'a str,
    pub game: &'a str,
    pub online: bool,
    pub dlc: bool,
    pub is_vr: bool,
    pub update_flow: bool,
    pub version: Option<&'a str>,
    pub size: &'a str,
    pub target_dir: &'a Path,
    pub notification_theme: Option<&'a str>,
}

impl DownloadArgs<'_> {
    pub fn to_args(&self, kind: HelperKind) -> Vec<String> {
        let mut args = vec![
            helper_link(kind, self.link),
            self.game.to_string(),
            flag(self.online),
            flag(self.dlc),
            flag(self.is_vr),
            flag(self.update_flow),
            version_arg(self.version),
            self.size.to_string(),
            self.target_dir.to_string_lossy().to_string(),
        ];
        if let Some(theme) = self.notification_theme {
            args.push("--withNotification".to_string());
            args.push(theme.to_string());
        }
        args
    }
}

/// Retries use the older, shorter argument list.
#[derive(Clone, Debug)]
pub struct RetryArgs<'a> {
    pub link: &'a str,
    pub game: &'a str,
    pub online: bool,
    pub dlc: bool,
    pub version: Option<&'a str>,
    pub target_dir: &'a Path,
}

impl RetryArgs<'_> {
    pub fn to_args(&self, kind: HelperKind) -> Vec<String> {
        vec![
            helper_link(kind, self.link),
            self.game.to_string(),
            flag(self.online),
            flag(self.dlc),
            version_arg(self.version),
            "0".to_string(),
            self.target_dir.to_string_lossy().to_string(),
        ]
    }
}

#[derive(Clone, Debug)]
enum LocatorMode {
    Platform { helper_dir: PathBuf },
    Fixed { program: PathBuf, leading_args: Vec<String> },
}

/// Turns a helper kind into a concrete program and argument prefix.
#[derive(Clone, Debug)]
pub struct HelperLocator {
    mode: LocatorMode,
}

#[derive(Clone, Debug)]
pub struct HelperCommand {
    pub kind: HelperKind,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperLocator {
    /// `<dir>/<name>.exe` on Windows, `python3 <dir>/<name>.py` elsewhere.
    pub fn platform(helper_dir: PathBuf) -> Self {
        Self {
            mode: LocatorMode::Platform { helper_dir },
        }
    }

    /// Runs every helper through one program; used by tests and custom builds.
    pub fn fixed(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            mode: LocatorMode::Fixed {
                program: program.into(),
                leading_args,
            },
        }
    }

    pub fn command(&self, kind: HelperKind, args: Vec<String>) -> Result<HelperCommand> {
        match &self.mode {
            LocatorMode::Fixed {
                program,
                leading_args,
            } => Ok(HelperCommand {
                kind,
                program: program.clone(),
                args: leading_args.iter().cloned().chain(args).collect(),
            }),
            LocatorMode::Platform { helper_dir } => platform_command(helper_dir, kind, args),
        }
    }
}

#[cfg(target_os = "windows")]
fn platform_command(helper_dir: &Path, kind: HelperKind, args: Vec<String>) -> Result<HelperCommand> {
    let program = helper_dir.join(format!("{}.exe", kind.name()));
    if !program.exists() {
        return Err(CoreError::Process(format!(
            "{} not found at {}",
            kind.name(),
            program.display()
        )));
    }
    Ok(HelperCommand {
        kind,
        program,
        args,
    })
}

#[cfg(not(target_os = "windows"))]
fn platform_command(helper_dir: &Path, kind: HelperKind, args: Vec<String>) -> Result<HelperCommand> {
    let script = helper_dir.join(format!("{}.py", kind.name()));
    Ok(HelperCommand {
        kind,
        program: PathBuf::from("python3"),
        args: std::iter::once(script.to_string_lossy().to_string())
            .chain(args)
            .collect(),
    })
}

impl HelperCommand {
    /// Stdout is piped for the event stream, stderr for logging.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(target_os = "windows")]
        {
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command
    }
}

/// Drains a child pipe into the log so the child never blocks on a full pipe.
pub fn log_lines<R>(reader: R, label: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!("[{}] {}", label, line),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("[{}] stream closed: {}", label, err);
                    break;
                }
            }
        }
    })
}

/// A live OS process that looks like one of our helpers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelperProcessInfo {
    pub pid: u32,
    pub kind: HelperKind,
    pub game: Option<String>,
}

/// Finds the helper program in a command line and reads the game name that
/// follows the link.
pub fn parse_helper_cmdline(cmd: &[String]) -> Option<(HelperKind, Option<String>)> {
    let (index, kind) = cmd
        .iter()
        .take(2)
        .enumerate()
        .find_map(|(index, part)| HelperKind::from_program(part).map(|kind| (index, kind)))?;
    let game = if kind.is_downloader() {
        cmd.get(index + 2).cloned()
    } else {
        None
    };
    Some((kind, game))
}

/// Downloader helpers running for `game` (sanitized), or all of them when
/// `game` is `None`. Blocking: call from `spawn_blocking`.
pub fn scan_downloader_processes(game: Option<&str>) -> Vec<HelperProcessInfo> {
    let mut system = System::new();
    system.refresh_processes();
    let own_pid = std::process::id();

    system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter_map(|(pid, process)| {
            let (kind, parsed_game) = parse_helper_cmdline(process.cmd())
                .or_else(|| HelperKind::from_program(process.name()).map(|kind| (kind, None)))?;
            if !kind.is_downloader() {
                return None;
            }
            if let Some(game) = game {
                let matches = match parsed_game.as_deref() {
                    Some(parsed) => normalize_game_name(parsed) == game,
                    None => process.cmd().iter().any(|part| part.contains(game)),
                };
                if !matches {
                    return None;
                }
            }
            Some(HelperProcessInfo {
                pid: pid.as_u32(),
                kind,
                game: parsed_game,
            })
        })
        .collect()
}

/// Blocking. A process that is already gone counts as killed.
pub fn kill_pid(pid: u32) -> Result<()> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(target) {
        return Ok(());
    }
    match system.process(target) {
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(CoreError::Process(format!("failed to kill process {pid}"))),
        None => Ok(()),
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_helper_by_source_then_link() {
        assert_eq!(HelperKind::for_link("https://gofile.io/d/abc", true), HelperKind::Torrent);
        assert_eq!(HelperKind::for_link("gofile.io/d/abc", false), HelperKind::Gofile);
        assert_eq!(HelperKind::for_link("https://example.com/file", false), HelperKind::Generic);
    }

    #[test]
    fn download_args_follow_positional_layout() {
        let target = PathBuf::from("/games");
        let args = DownloadArgs {
            link: "gofile.io/d/abc",
            game: "My Game",
            online: true,
            dlc: false,
            is_vr: false,
            update_flow: false,
            version: Some(""),
            size: "5GB",
            target_dir: &target,
            notification_theme: Some("purple"),
        }
        .to_args(HelperKind::Gofile);
        assert_eq!(
            args,
            vec![
                "https://gofile.io/d/abc",
                "My Game",
                "true",
                "false",
                "false",
                "false",
                "-1",
                "5GB",
                "/games",
                "--withNotification",
                "purple",
            ]
        );
    }

    #[test]
    fn fixed_locator_prefixes_program_args() {
        let locator = HelperLocator::fixed("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
        let command = locator
            .command(HelperKind::Generic, vec!["link".to_string()])
            .expect("command");
        assert_eq!(command.program, PathBuf::from("sh"));
        assert_eq!(command.args, vec!["-c", "sleep 30", "link"]);
    }

    #[test]
    fn parses_helper_command_lines() {
        let python = vec![
            "python3".to_string(),
            "/opt/resources/AscendaraDownloader.py".to_string(),
            "https://x/file".to_string(),
            "My Game".to_string(),
        ];
        assert_eq!(
            parse_helper_cmdline(&python),
            Some((HelperKind::Generic, Some("My Game".to_string())))
        );

        let exe = vec![
            "C:\\Ascendara\\resources\\AscendaraTorrentHandler.exe".to_string(),
            "magnet:?xt".to_string(),
            "Other".to_string(),
        ];
        assert_eq!(
            parse_helper_cmdline(&exe),
            Some((HelperKind::Torrent, Some("Other".to_string())))
        );

        let unrelated = vec!["bash".to_string(), "-c".to_string(), "AscendaraDownloader".to_string()];
        assert_eq!(parse_helper_cmdline(&unrelated), None);
    }
}

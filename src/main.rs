mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use lian_winget::package_manager::{StreamEvent, StreamKind};
use lian_winget::{Config, PackageManager, WingetError};
use std::future::Future;
use std::io::Write;

const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    // 加载配置
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::List { text } => {
            let pm = PackageManager::new(&config);
            let records = if text { pm.list_text().await } else { pm.list().await };
            match records {
                Ok(records) => println!("{}", serde_json::to_string_pretty(&records)?),
                Err(e) => exit_with(e),
            }
        }
        Commands::Upgrade { id, name, track_id } => {
            let pm = PackageManager::new(&config);
            let track_id = track_id.unwrap_or_else(default_track_id);
            let op = pm.upgrade_named(&id, name.as_deref(), Some(track_id.as_str()));
            finish(run_tracked(&pm, &track_id, op).await);
        }
        Commands::UpgradeAll { track_id } => {
            let pm = PackageManager::new(&config);
            let track_id = track_id.unwrap_or_else(default_track_id);
            let op = pm.upgrade_all(Some(track_id.as_str()));
            finish(run_tracked(&pm, &track_id, op).await);
        }
        Commands::Uninstall { id, name, track_id } => {
            let pm = PackageManager::new(&config);
            let track_id = track_id.unwrap_or_else(default_track_id);
            let op = pm.uninstall_named(&id, name.as_deref(), Some(track_id.as_str()));
            finish(run_tracked(&pm, &track_id, op).await);
        }
        Commands::ResolveDir { raw } => print_dir(lian_winget::resolve_install_directory(&raw)),
        Commands::DeriveDir { command } => {
            print_dir(lian_winget::derive_directory_from_command(&command))
        }
    }

    Ok(())
}

fn default_track_id() -> String {
    format!("cli-{}", std::process::id())
}

/// 运行一个可取消的操作：实时打印输出，Ctrl-C 时按 track id 取消
async fn run_tracked<F>(pm: &PackageManager, track_id: &str, op: F) -> lian_winget::Result<String>
where
    F: Future<Output = lian_winget::Result<String>>,
{
    let mut events = pm.subscribe();
    let mut cancel_requested = false;
    tokio::pin!(op);

    let result = loop {
        tokio::select! {
            result = &mut op => break result,
            Some(event) = events.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                let cancel = pm.cancel(track_id);
                match cancel.error {
                    None => log::info!("已请求取消 {}", track_id),
                    Some(e) => log::warn!("取消 {} 失败: {}", track_id, e),
                }
            }
        }
    };

    // 进程退出前发出的输出都已经排在队列里
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    result
}

fn print_event(event: &StreamEvent) {
    match event.stream {
        StreamKind::Stdout => {
            print!("{}", event.data);
            let _ = std::io::stdout().flush();
        }
        StreamKind::Stderr => eprint!("{}", event.data),
    }
}

fn finish(result: lian_winget::Result<String>) {
    if let Err(e) = result {
        exit_with(e);
    }
}

fn exit_with(err: WingetError) -> ! {
    if err.is_cancelled() {
        eprintln!("已取消");
        std::process::exit(EXIT_CANCELLED);
    }
    eprintln!("错误: {}", err);
    std::process::exit(EXIT_FAILURE);
}

fn print_dir(dir: Option<String>) {
    match dir {
        Some(dir) => println!("{}", dir),
        None => {
            eprintln!("无法推断安装目录");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

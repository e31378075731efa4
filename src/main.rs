use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use clip_classifier::commands;
use clip_classifier::model::PipelineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(next_line_help = true)]
struct Cli {
    /// 設定ファイル（省略時は ./config.json、無ければデフォルト設定）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// データセットからPCAとSVMを学習してバンドルを保存
    Train,
    /// 1件ずつの推論時間を計測
    Benchmark,
    /// カテゴリ内の誤判定画像を wrong ディレクトリへ移動
    Audit {
        /// 監査するカテゴリ（0 = イベントなし, 1 = イベントあり）
        #[arg(long, default_value = "1")]
        category: usize,
    },
    /// 学習済みモデルをONNXに書き出す
    Export,
    /// フレーム画像ディレクトリからイベント時刻を検出
    Detect {
        #[arg(long)]
        frames: PathBuf,
        /// 解析フレームレート (fps)
        #[arg(long)]
        rate: Option<f64>,
    },
    /// 元解像度の画像から切り出し領域を別ファイルに保存
    Crop { src: PathBuf, dest: PathBuf },
    /// バンドルまたはONNXファイルの情報を表示
    Info { path: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = PipelineConfig::load_or_default(cli.config.as_deref());
    match cli.command {
        Command::Train => {
            config.display();
            let summary = commands::train(&config)?;
            if !summary.converged {
                log::warn!("SVMは収束しないまま保存されました");
            }
        }
        Command::Benchmark => {
            commands::benchmark(&config)?;
        }
        Command::Audit { category } => {
            commands::audit(&config, category)?;
        }
        Command::Export => {
            commands::export(&config)?;
        }
        Command::Detect { frames, rate } => {
            commands::detect(&config, &frames, rate)?;
        }
        Command::Crop { src, dest } => {
            commands::crop(&config, &src, &dest)?;
        }
        Command::Info { path } => {
            commands::info(&path)?;
        }
    }
    Ok(())
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use iqdb_search::client::config::DEBUG_ENV;
use iqdb_search::{ClientConfig, SearchClient, SearchResult};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

const DATA_DIR: &str = "./data";
const RESULTS_FILE: &str = "./data/search_results.jsonl";

/// 每次搜尋寫一行到 results 檔
#[derive(Serialize)]
struct SearchRecord<'a> {
    query: &'a str,
    service: &'a str,
    searched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let debug = env::var(DEBUG_ENV).is_ok_and(|v| v == "1");
    tracing_subscriber::fmt().with_env_filter(log_filter(debug)?).init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("search-url") => {
            let url = args.get(2).context("缺少圖片 URL")?;
            let download = args.iter().skip(3).any(|a| a == "--download");
            run_search(Query::Url(url, download), is_3d(&args)).await?
        }
        Some("search-file") => {
            let path = args.get(2).context("缺少圖片路徑")?;
            run_search(Query::File(path), is_3d(&args)).await?
        }
        Some("info") => print_info(args.get(2).map(String::as_str) == Some("3d"))?,
        Some("--help") | Some("-h") | None => print_help(),
        Some(other) => {
            println!("未知命令: {}", other);
            print_help();
        }
    }

    Ok(())
}

/// `RUST_LOG` 或預設 info；除錯模式另外打開本 crate 的 debug 輸出
fn log_filter(debug: bool) -> Result<EnvFilter> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if debug {
        return Ok(filter.add_directive("iqdb_search=debug".parse::<Directive>()?));
    }
    Ok(filter)
}

enum Query<'a> {
    Url(&'a str, bool),
    File(&'a str),
}

impl Query<'_> {
    fn as_str(&self) -> &str {
        match self {
            Query::Url(url, _) => *url,
            Query::File(path) => *path,
        }
    }
}

fn is_3d(args: &[String]) -> bool {
    args.iter().skip(3).any(|a| a == "--3d")
}

fn config_for(three_d: bool) -> ClientConfig {
    if three_d {
        ClientConfig::three_d()
    } else {
        ClientConfig::default()
    }
}

async fn run_search(query: Query<'_>, three_d: bool) -> Result<()> {
    let client = SearchClient::new(config_for(three_d))?;

    // Ctrl+C 取消進行中的搜尋
    let cancel = client.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.interrupt();
        }
    });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]")?);
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("🔍 搜尋中: {}", query.as_str()));

    let outcome = match &query {
        Query::Url(url, download) => client.search_by_url(url, Some(*download).filter(|d| *d)).await,
        Query::File(path) => client.search_by_file(Path::new(path)).await,
    };
    spinner.finish_and_clear();

    let service = client.config().profile.name;
    match &outcome {
        Ok(result) => {
            print_result(result);
            append_record(&SearchRecord {
                query: query.as_str(),
                service,
                searched_at: Utc::now(),
                result: Some(result),
                error: None,
            })?;
        }
        Err(e) => {
            println!("❌ 搜尋失敗 ({:?}): {}", e.kind(), e);
            append_record(&SearchRecord {
                query: query.as_str(),
                service,
                searched_at: Utc::now(),
                result: None,
                error: Some(e.to_string()),
            })?;
        }
    }

    println!("\n💾 結果已寫入 {}", RESULTS_FILE);
    Ok(())
}

fn print_result(result: &SearchResult) {
    for line in result_lines(result) {
        println!("{}", line);
    }
}

fn result_lines(result: &SearchResult) -> Vec<String> {
    let mut lines = vec![format!(
        "✅ 搜尋了 {} 張圖片，耗時 {:.2} 秒",
        result.searched_image_count, result.searched_duration
    )];

    if let Some(resolution) = result.your_image.as_ref().and_then(|image| image.resolution) {
        lines.push(format!("  上傳圖片: {}", resolution));
    }

    if result.matches.is_empty() {
        lines.push("  沒有相關結果".to_string());
        return lines;
    }

    for m in &result.matches {
        let similarity = m.similarity.map(|s| format!("{:.0}%", s)).unwrap_or_else(|| "-".to_string());
        let source = m.source.map(|s| s.display_name()).unwrap_or("?");
        lines.push(format!("  [{:?}] {:>5} {:<12} {}", m.kind, similarity, source, m.target_url));
    }

    if result.more_results_pointer.is_some() {
        lines.push("  (還有更多結果)".to_string());
    }
    lines
}

fn append_record(record: &SearchRecord<'_>) -> Result<()> {
    fs::create_dir_all(DATA_DIR)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(RESULTS_FILE)?;

    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

fn print_info(three_d: bool) -> Result<()> {
    let client = SearchClient::new(config_for(three_d))?;
    println!("{}", serde_json::to_string_pretty(&client.search_info())?);
    Ok(())
}

fn print_help() {
    println!("IQDB Search - 以圖搜圖工具\n");
    println!("用法:");
    println!("  cargo run search-url <url> [--download] [--3d]  # 以圖片 URL 搜尋");
    println!("  cargo run search-file <path> [--3d]             # 以本機圖片搜尋");
    println!("  cargo run info [3d]                             # 顯示服務設定");
    println!("  cargo run --help                                # 顯示此幫助\n");
    println!("環境變數:");
    println!("  RUST_LOG=debug   # 詳細日誌");
    println!("  IQDB_DEBUG=1     # 輸出原始 HTML 與解析細節\n");
    println!("資料檔案:");
    println!("  ./data/search_results.jsonl  # 搜尋結果");
}

#[cfg(test)]
mod tests {
    use super::*;
    use iqdb_search::{Match, MatchKind, Rating};

    fn result_with(kind: MatchKind) -> SearchResult {
        SearchResult {
            searched_image_count: 100,
            searched_duration: 0.5,
            matches: vec![Match {
                kind,
                target_url: "https://gelbooru.com/p/1".to_string(),
                preview_url: None,
                rating: Rating::Unrated,
                score: None,
                tags: None,
                source: None,
                resolution: None,
                similarity: Some(71.0),
            }],
            your_image: None,
            more_results_pointer: None,
        }
    }

    #[test]
    fn test_non_best_matches_are_listed() {
        let lines = result_lines(&result_with(MatchKind::Possible));
        assert!(lines.iter().any(|l| l.contains("https://gelbooru.com/p/1")));
        assert!(!lines.iter().any(|l| l.contains("沒有相關結果")));
    }

    #[test]
    fn test_empty_result_is_reported() {
        let mut result = result_with(MatchKind::Best);
        result.matches.clear();
        let lines = result_lines(&result);
        assert!(lines.iter().any(|l| l.contains("沒有相關結果")));
    }

    #[test]
    fn test_debug_mode_enables_crate_debug_logs() {
        let filter = log_filter(true).unwrap();
        assert!(filter.to_string().contains("iqdb_search=debug"));
    }
}

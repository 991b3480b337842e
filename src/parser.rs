use crate::error::{IqdbError, Result};
use crate::types::{
    Match, MatchKind, MoreResultsPointer, QueueStatus, Rating, Resolution, SearchResult, Source,
    YourImage,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeSet;

/// 伺服器讀不到查詢結果時的訊息
const READ_QUERY_FAILED: &str = "can't read query result!";
/// 同一 session 的前一個查詢尚未結束
const OTHER_QUERY_PENDING: &str = "please wait for your other query to finish";
/// 過載排隊通知
const QUEUE_NOTICE: &str = "place in queue:";
const NO_RELEVANT_MATCHES: &str = "no relevant matches";

/// 以 https 補上 `//host/...` 的已知網域，其餘補 http
const HTTPS_HOSTS: &[&str] = &[
    "iqdb.org", "danbooru", "gelbooru", "yande.re", "konachan", "zerochan", "sankaku",
    "e-shuushuu", "anime-pictures",
];

/// 暫態錯誤快速檢查：只掃原始文字，不建 DOM
///
/// 出現時代表應該稍後重試，而不是把回應當成最終結果。
pub fn detect_transient(html: &str) -> Option<IqdbError> {
    // ASCII 小寫不改變 byte 位置
    let lower = html.to_ascii_lowercase();

    for signal in [READ_QUERY_FAILED, OTHER_QUERY_PENDING] {
        if let Some(at) = lower.find(signal) {
            return Some(IqdbError::RetryableQuery {
                message: html[at..at + signal.len()].to_string(),
                queue: None,
            });
        }
    }

    let start = lower.find(QUEUE_NOTICE)?;
    let after = &html[start + QUEUE_NOTICE.len()..];
    let position = after
        .trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|digits| digits.parse::<u32>().ok());

    let line = html[..start]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let line_end = html[start..].find('\n').map(|i| start + i).unwrap_or(html.len());
    let message = html[line..line_end].trim().to_string();

    Some(IqdbError::RetryableQuery {
        message: message.clone(),
        queue: Some(QueueStatus {
            position,
            message,
            raw_html: html.to_string(),
        }),
    })
}

/// IQDB 結果頁解析器
///
/// 純函式：同一份 HTML 永遠得到相同結果，呼叫之間不保留狀態。
pub struct ResultParser {
    base_url: String,
    debug: bool,
    error_selector: Selector,
    row_selector: Selector,
    more_row_selector: Selector,
    table_selector: Selector,
    header_selector: Selector,
    link_selector: Selector,
    image_selector: Selector,
    cell_selector: Selector,
    see_more_selector: Selector,
    stats_regex: Regex,
    similarity_regex: Regex,
    resolution_regex: Regex,
    score_regex: Regex,
    rating_regex: Regex,
    tags_regex: Regex,
    size_regex: Regex,
}

/// `#pages` 裡依種類分桶的結果
#[derive(Default)]
struct PageRows {
    best: Vec<Match>,
    additional: Vec<Match>,
    possible: Vec<Match>,
    your_image: Option<YourImage>,
    explained_empty: bool,
}

impl PageRows {
    fn push(&mut self, m: Match) {
        match m.kind {
            MatchKind::Best => self.best.push(m),
            MatchKind::Additional => self.additional.push(m),
            MatchKind::Possible | MatchKind::Other => self.possible.push(m),
        }
    }

    /// best 在前，接著 additional，最後 possible / other
    fn into_matches(self) -> Vec<Match> {
        let mut matches = self.best;
        matches.extend(self.additional);
        matches.extend(self.possible);
        matches
    }
}

impl ResultParser {
    pub fn new(base_url: &str, debug: bool) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            debug,
            error_selector: selector(".err")?,
            row_selector: selector("#pages > div")?,
            more_row_selector: selector("#more1 .pages > div")?,
            table_selector: selector("table")?,
            header_selector: selector("th")?,
            link_selector: selector("a[href]")?,
            image_selector: selector("img")?,
            cell_selector: selector("td")?,
            see_more_selector: selector("#show1 a[href]")?,
            stats_regex: regex(r"(?i)searched\s+([\d,]+)\s+images?\s+in\s+([\d.]+)\s+seconds?")?,
            similarity_regex: regex(r"(\d+(?:\.\d+)?)%\s*similarity")?,
            resolution_regex: regex(r"(\d+)×(\d+)")?,
            score_regex: regex(r"Score:\s*(-?\d+)")?,
            rating_regex: regex(r"(?i)Rating:\s*(\w+)")?,
            tags_regex: regex(r"Tags:\s*([^\r\n]*)")?,
            size_regex: regex(r"(?i)\b(\d+(?:\.\d+)?\s*[KMG]i?B)\b")?,
        })
    }

    /// 將 IQDB 回傳的 HTML 轉成 `SearchResult`
    pub fn parse(&self, html: &str) -> Result<SearchResult> {
        if self.debug {
            tracing::debug!(target: "iqdb_search::html", "回應內容 ({} bytes):\n{}", html.len(), html);
        }

        if let Some(err) = detect_transient(html) {
            return Err(err);
        }

        let document = Html::parse_document(html);
        self.check_for_errors(&document)?;

        let (searched_image_count, searched_duration) = self.parse_search_stats(&document);
        let rows = self.parse_rows(&document);
        let explained_empty = rows.explained_empty || mentions_no_relevant_matches(&document);
        let your_image = rows.your_image.clone();
        let matches = rows.into_matches();

        if matches.is_empty() && !explained_empty {
            return Err(IqdbError::NoMatchFound);
        }

        Ok(SearchResult {
            searched_image_count,
            searched_duration,
            matches,
            your_image,
            more_results_pointer: self.parse_more_pointer(&document),
        })
    }

    /// `.err` 區塊有文字就代表伺服器宣告了錯誤
    fn check_for_errors(&self, document: &Html) -> Result<()> {
        let Some(element) = document.select(&self.error_selector).next() else {
            return Ok(());
        };

        let text = collapse_text(element);
        if text.is_empty() {
            return Ok(());
        }

        let lower = text.to_lowercase();
        let err = if lower.contains("too large") {
            IqdbError::image_too_large(text)
        } else if lower.contains("http request failed") {
            IqdbError::http(text)
        } else if lower.contains("not an image") {
            IqdbError::not_an_image(text)
        } else {
            IqdbError::invalid_format(text)
        };

        Err(err)
    }

    /// 搜尋統計，找不到或無法解析時回傳 (0, 0.0)
    fn parse_search_stats(&self, document: &Html) -> (u64, f64) {
        let node = document.root_element().text().find(|t| {
            let lower = t.to_lowercase();
            lower.contains("searched") && lower.contains("seconds")
        });

        // 數字可能被 <b> 之類的標籤拆開，退回整份文字
        let captured = node
            .and_then(|t| self.stats_regex.captures(t))
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .or_else(|| {
                let full = collapse_text(document.root_element());
                self.stats_regex
                    .captures(&full)
                    .map(|c| (c[1].to_string(), c[2].to_string()))
            });

        match captured {
            Some((count, seconds)) => self.stats_from(&count, &seconds),
            None => (0, 0.0),
        }
    }

    fn stats_from(&self, count: &str, seconds: &str) -> (u64, f64) {
        let parsed = count
            .replace(',', "")
            .parse::<u64>()
            .ok()
            .zip(seconds.parse::<f64>().ok());

        parsed.unwrap_or_else(|| {
            if self.debug {
                tracing::debug!("搜尋統計無法解析: {} images / {} seconds", count, seconds);
            }
            (0, 0.0)
        })
    }

    fn parse_rows(&self, document: &Html) -> PageRows {
        let mut rows = PageRows::default();

        for div in document.select(&self.row_selector) {
            let Some(table) = div.select(&self.table_selector).next() else {
                continue;
            };
            let Some(header) = table.select(&self.header_selector).next() else {
                continue;
            };

            let title = collapse_text(header).to_lowercase();
            if title.contains("your image") {
                rows.your_image = Some(self.parse_your_image(table));
                continue;
            }
            if title.contains(NO_RELEVANT_MATCHES) {
                rows.explained_empty = true;
                continue;
            }

            let kind = if title.contains("best match") {
                MatchKind::Best
            } else if title.contains("additional match") {
                MatchKind::Additional
            } else if title.contains("possible match") {
                MatchKind::Possible
            } else {
                MatchKind::Other
            };

            self.collect_row(table, kind, &mut rows);
        }

        for div in document.select(&self.more_row_selector) {
            if let Some(table) = div.select(&self.table_selector).next() {
                self.collect_row(table, MatchKind::Other, &mut rows);
            }
        }

        rows
    }

    /// 單列失敗只丟棄該列
    fn collect_row(&self, table: ElementRef<'_>, kind: MatchKind, rows: &mut PageRows) {
        match self.parse_match(table, kind) {
            Ok(m) => {
                if self.debug {
                    tracing::debug!(target: "iqdb_search::match", "{:?}", m);
                }
                rows.push(m);
            }
            Err(reason) => {
                if self.debug {
                    tracing::debug!(target: "iqdb_search::match", "略過 {:?} 列: {}", kind, reason);
                }
            }
        }
    }

    fn parse_match(&self, table: ElementRef<'_>, kind: MatchKind) -> std::result::Result<Match, &'static str> {
        let href = table
            .select(&self.link_selector)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .ok_or("缺少連結")?;

        let image = table.select(&self.image_selector).next();
        let attr = |name: &str| {
            image
                .and_then(|img| img.value().attr(name))
                .unwrap_or_default()
                .to_string()
        };
        let preview_url = image
            .and_then(|img| img.value().attr("src"))
            .filter(|src| !src.is_empty())
            .map(|src| normalize_url(src, &self.base_url));

        // alt 與 title 通常內容相同，各自解析，不可串接
        let text = collapse_text(table);
        let fields = [attr("alt"), attr("title"), text.clone()];
        let combined = fields.join(" ");

        Ok(Match {
            kind,
            target_url: normalize_url(href, &self.base_url),
            preview_url,
            rating: fields
                .iter()
                .map(|field| self.parse_rating(field))
                .find(|rating| *rating != Rating::Unrated)
                .unwrap_or_default(),
            score: fields.iter().find_map(|field| {
                self.score_regex
                    .captures(field)
                    .and_then(|c| c[1].parse().ok())
            }),
            tags: self.parse_tags(&fields),
            source: Source::find_in(&text),
            resolution: self.parse_resolution(&combined),
            similarity: self
                .similarity_regex
                .captures(&combined)
                .and_then(|c| c[1].parse().ok()),
        })
    }

    fn parse_your_image(&self, table: ElementRef<'_>) -> YourImage {
        let text = collapse_text(table);
        let resolution = self.parse_resolution(&text);
        let size = self.size_regex.captures(&text).map(|c| c[1].to_string());
        let preview_url = table
            .select(&self.image_selector)
            .next()
            .and_then(|img| img.value().attr("src"))
            .filter(|src| !src.is_empty())
            .map(|src| normalize_url(src, &self.base_url));

        let name = table
            .select(&self.cell_selector)
            .map(collapse_text)
            .find(|cell| {
                !cell.is_empty()
                    && !self.resolution_regex.is_match(cell)
                    && !self.size_regex.is_match(cell)
            });

        YourImage {
            name,
            resolution,
            preview_url,
            size,
        }
    }

    fn parse_resolution(&self, text: &str) -> Option<Resolution> {
        let c = self.resolution_regex.captures(text)?;
        Resolution::new(c[1].parse().ok()?, c[2].parse().ok()?)
    }

    /// 先看 `[Safe]` 這類標記，再看 `Rating: s`
    fn parse_rating(&self, text: &str) -> Rating {
        let lower = text.to_lowercase();
        if lower.contains("[safe]") {
            return Rating::Safe;
        }
        if lower.contains("[ero]") || lower.contains("[questionable]") {
            return Rating::Questionable;
        }
        if lower.contains("[explicit]") {
            return Rating::Explicit;
        }

        match self
            .rating_regex
            .captures(text)
            .map(|c| c[1].to_lowercase())
            .as_deref()
        {
            Some("s" | "safe") => Rating::Safe,
            Some("q" | "questionable" | "ero") => Rating::Questionable,
            Some("e" | "explicit") => Rating::Explicit,
            _ => Rating::Unrated,
        }
    }

    /// 每個欄位各自擷取 `Tags:` 後的內容再取聯集
    fn parse_tags(&self, fields: &[String]) -> Option<BTreeSet<String>> {
        let tags: BTreeSet<String> = fields
            .iter()
            .filter_map(|field| self.tags_regex.captures(field))
            .flat_map(|c| {
                c[1].split_whitespace()
                    .map(|tag| tag.trim_matches(',').to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|tag| !tag.is_empty())
            .collect();

        if tags.is_empty() { None } else { Some(tags) }
    }

    fn parse_more_pointer(&self, document: &Html) -> Option<MoreResultsPointer> {
        document
            .select(&self.see_more_selector)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
            .map(|href| MoreResultsPointer {
                href: href.to_string(),
            })
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| IqdbError::structure(format!("選擇器解析失敗 {}: {:?}", css, e)))
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| IqdbError::structure(format!("正規表示式錯誤: {}", pattern)).caused_by(e))
}

/// 元素內所有文字節點以空白串起
fn collapse_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn mentions_no_relevant_matches(document: &Html) -> bool {
    collapse_text(document.root_element())
        .to_lowercase()
        .contains(NO_RELEVANT_MATCHES)
}

/// 正規化 URL（處理 `//host`、根目錄與相對路徑）
fn normalize_url(url: &str, base_url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("//") {
        let scheme = if HTTPS_HOSTS.iter().any(|host| rest.contains(host)) {
            "https"
        } else {
            "http"
        };
        format!("{}://{}", scheme, rest)
    } else if url.starts_with('/') {
        format!("{}{}", base_url, url)
    } else {
        format!("{}/{}", base_url, url)
    }
}

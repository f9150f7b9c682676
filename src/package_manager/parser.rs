//! 输出解析函数
//!
//! `winget list` 的文本表格没有稳定格式：列数随版本变化，表头和汇总行随 locale 变化，
//! 进度动画还会混入控制字符。这里把解析拆成若干互不依赖的行过滤器，
//! 再按列数分派成 `PackageRecord`。宁可漏掉一行，也不要凭空造出一条记录，
//! 因为后续的 upgrade / uninstall 都以解析出的 id 为准。

use super::types::{FieldAliases, PackageRecord};
use crate::diagnostics::log_event;
use crate::error::{Result, WingetError};
use serde_json::{json, Value};

/// 清理终端输出中的 ANSI 转义序列和特殊字符
///
/// 单独的 `\r`（winget 的旋转进度条）被视为换行，这样进度帧会落到独立的行上，
/// 随后被装饰行过滤器丢弃。
pub fn clean_terminal_output(input: &str) -> String {
    let mut result = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        chars.next();
                        if next.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            }
            '\r' => {
                if chars.peek() != Some(&'\n') && !result.ends_with('\n') {
                    result.push('\n');
                }
            }
            c if c.is_control() && c != '\n' && c != '\t' => {}
            _ => result.push(c),
        }
    }

    result
}

// ========== 字符分类 ==========

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// 至少含有一个 ASCII 字母数字或 CJK 字符
pub fn has_word_char(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_alphanumeric() || is_cjk(c))
}

fn is_ascii_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}')
}

/// 只由 `- | \ /`、空白和控制字符组成
fn is_junk_pattern(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| matches!(c, '-' | '|' | '\\' | '/') || c.is_whitespace() || is_ascii_control(c))
}

/// 判断一个列值是否只是装饰字符，不携带数据
pub fn is_junk_token(token: &str) -> bool {
    let stripped: String = token.chars().filter(|&c| !is_ascii_control(c)).collect();
    let cleaned = stripped.trim();
    if cleaned.is_empty() {
        return true;
    }
    if cleaned
        .chars()
        .all(|c| matches!(c, '-' | '|' | '\\' | '/') || c.is_whitespace())
    {
        return true;
    }
    let mut chars = cleaned.chars();
    match (chars.next(), chars.next()) {
        (Some(only), None) => !only.is_ascii_digit(),
        _ => false,
    }
}

/// 按两个及以上连续空白切分列
pub fn split_columns(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut run_start: Option<usize> = None;
    let mut run_len = 0;

    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_len += 1;
        } else {
            if let Some(rs) = run_start.take() {
                if run_len >= 2 {
                    fields.push(&line[start..rs]);
                    start = i;
                }
            }
            run_len = 0;
        }
    }
    fields.push(&line[start..]);

    fields
        .into_iter()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect()
}

// ========== 行过滤器 ==========

const HEADER_KEYWORDS: &[&str] = &[
    "name",
    "id",
    "version",
    "available",
    "source",
    "match",
    "packageidentifier",
    "名称",
    "版本",
    "可用",
    "源",
    "匹配",
];

fn is_english_header(line: &str) -> bool {
    let mut words = line.split_whitespace().map(str::to_ascii_lowercase);
    matches!(
        (words.next(), words.next(), words.next()),
        (Some(a), Some(b), Some(c)) if a == "name" && b == "id" && c.starts_with("version")
    )
}

fn is_localized_header(line: &str) -> bool {
    split_columns(line)
        .iter()
        .filter(|field| {
            let lower = field.to_lowercase();
            HEADER_KEYWORDS.contains(&lower.as_str())
        })
        .count()
        >= 2
}

fn is_separator_line(line: &str) -> bool {
    let rule = line.chars().count() >= 3
        && line
            .chars()
            .all(|c| matches!(c, '-' | '=') || c.is_whitespace());
    rule || line.starts_with("----------")
}

/// 表头或分隔线
pub fn is_header_line(line: &str) -> bool {
    is_english_header(line) || is_localized_header(line) || is_separator_line(line)
}

const SUMMARY_KEYWORDS: &[&str] = &[
    "upgrades available",
    "upgrade available",
    "升级可用",
    "upgrades",
    "升级",
];

const NO_MATCH_SENTINELS: &[&str] = &[
    "找不到与输入条件匹配的已安装程序包",
    "no installed package found matching input criteria",
];

/// 行首匹配汇总关键字时返回关键字的字节长度（ASCII 部分忽略大小写）
fn summary_keyword_len(s: &str) -> Option<usize> {
    SUMMARY_KEYWORDS
        .iter()
        .find(|k| s.get(..k.len()).is_some_and(|head| head.eq_ignore_ascii_case(k)))
        .map(|k| k.len())
}

/// `3 upgrades available.` / `3 升级可用。` 以及 `升级可用: 3` 这种关键字在前的写法
pub fn is_summary_line(line: &str) -> bool {
    let digits_end = line
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    if digits_end > 0 {
        return summary_keyword_len(line[digits_end..].trim_start()).is_some();
    }

    match summary_keyword_len(line) {
        Some(len) => {
            let rest = &line[len..];
            rest.chars().any(|c| c.is_ascii_digit())
                && rest.chars().all(|c| {
                    c.is_ascii_digit() || c.is_whitespace() || matches!(c, ':' | '：' | '.' | '。')
                })
        }
        None => false,
    }
}

pub fn is_no_match_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    NO_MATCH_SENTINELS.iter().any(|s| lower.starts_with(s))
}

fn is_decoration_line(line: &str) -> bool {
    !has_word_char(line)
}

type LineFilter = (&'static str, fn(&str) -> bool);

/// 命中任一过滤器的行直接丢弃；顺序无关
const LINE_FILTERS: &[LineFilter] = &[
    ("decoration", is_decoration_line),
    ("header", is_header_line),
    ("summary", is_summary_line),
    ("no-match", is_no_match_line),
];

fn rejected_by(line: &str) -> Option<&'static str> {
    LINE_FILTERS
        .iter()
        .find(|(_, reject)| reject(line))
        .map(|(name, _)| *name)
}

// ========== 列数分派 ==========

/// 把一行的列值映射为记录；不满足基本条件时返回 None
pub fn record_from_fields(fields: &[&str]) -> Option<PackageRecord> {
    if fields.is_empty() || fields.iter().all(|f| is_junk_token(f)) {
        return None;
    }
    if fields.len() < 2 || !has_word_char(fields[0]) || is_junk_token(fields[1]) {
        return None;
    }
    let record = match fields {
        [name, id, version, available, ..] => PackageRecord::new(*name, *id, *version, *available),
        [name, id, version] => PackageRecord::new(*name, *id, *version, ""),
        [name, id] => PackageRecord::new(*name, *id, "", ""),
        _ => return None,
    };
    Some(record)
}

/// 记录的最终检查，结构化解析的结果也走这里
pub fn is_plausible_record(record: &PackageRecord) -> bool {
    let name = record.name.trim();
    let id = record.id.trim();
    if !has_word_char(name) && !has_word_char(id) {
        return false;
    }
    !is_junk_pattern(name) && !is_junk_pattern(id)
}

/// 解析 `winget list` 的文本输出
pub fn parse_list(output: &str) -> Vec<PackageRecord> {
    let cleaned = clean_terminal_output(output);
    let lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    log_event(
        log::Level::Debug,
        "parse_list sample",
        json!({ "lines": lines.iter().take(12).collect::<Vec<_>>() }),
    );

    let mut records = Vec::new();
    for line in &lines {
        if let Some(filter) = rejected_by(line) {
            log_event(
                log::Level::Trace,
                "parse_list dropped line",
                json!({ "filter": filter, "line": line }),
            );
            continue;
        }
        if let Some(record) = record_from_fields(&split_columns(line)) {
            records.push(record);
        }
    }

    let before = records.len();
    records.retain(is_plausible_record);
    if records.len() != before {
        log::debug!("parse_list: 移除 {} 条可疑记录", before - records.len());
    }
    log::debug!("parse_list: 解析出 {} 条记录", records.len());

    records
}

// ========== 结构化输出 ==========

fn pick_field(item: &Value, aliases: &[String]) -> String {
    for key in aliases {
        match item.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    String::new()
}

/// 解析 `winget list --output json`；不是 JSON 数组时返回 ParseFallback
pub fn parse_json_list(output: &str, aliases: &FieldAliases) -> Result<Vec<PackageRecord>> {
    let value: Value = serde_json::from_str(output.trim())
        .map_err(|e| WingetError::ParseFallback(format!("invalid JSON: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        other => {
            let kind = match other {
                Value::Object(_) => "object",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                Value::Bool(_) => "bool",
                _ => "null",
            };
            return Err(WingetError::ParseFallback(format!(
                "expected a JSON array, got {}",
                kind
            )));
        }
    };

    Ok(items
        .iter()
        .map(|item| PackageRecord {
            name: pick_field(item, &aliases.name),
            id: pick_field(item, &aliases.id),
            version: pick_field(item, &aliases.version),
            available: pick_field(item, &aliases.available),
        })
        .filter(is_plausible_record)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn junk_tokens() {
        assert!(is_junk_token(""));
        assert!(is_junk_token("-"));
        assert!(is_junk_token("\\"));
        assert!(is_junk_token("|/-"));
        assert!(is_junk_token("\u{1}\u{2}"));
        assert!(is_junk_token("x"));
        assert!(!is_junk_token("7"));
        assert!(!is_junk_token("Git.Git"));
        assert!(!is_junk_token("ab"));
    }

    #[test]
    fn columns_split_on_double_whitespace_only() {
        assert_eq!(
            split_columns("Microsoft Edge   Microsoft.Edge  120.0.1 121.0"),
            vec!["Microsoft Edge", "Microsoft.Edge", "120.0.1 121.0"]
        );
        assert_eq!(split_columns("  a\t\tb  "), vec!["a", "b"]);
        assert!(split_columns("   ").is_empty());
    }

    #[test]
    fn header_detection() {
        assert!(is_header_line("Name   Id   Version   Available   Source"));
        assert!(is_header_line("name id version"));
        assert!(is_header_line("名称              ID               版本        可用        源"));
        assert!(is_header_line("-----------------------------------"));
        assert!(is_header_line("=== ==="));
        assert!(!is_header_line("NVIDIA Control Panel  NVIDIA.ControlPanel  8.1"));
        assert!(!is_header_line("Android Studio  Google.AndroidStudio  2023.1"));
    }

    #[test]
    fn summary_detection() {
        assert!(is_summary_line("3 upgrades available."));
        assert!(is_summary_line("1 upgrade available."));
        assert!(is_summary_line("3 升级可用。"));
        assert!(is_summary_line("12升级可用"));
        assert!(is_summary_line("升级可用: 3"));
        assert!(!is_summary_line("7-Zip  7zip.7zip  23.01"));
        assert!(!is_summary_line("Upgrades Manager  Some.Tool  1.0"));
    }

    #[test]
    fn no_match_sentinels() {
        assert!(is_no_match_line("找不到与输入条件匹配的已安装程序包。"));
        assert!(is_no_match_line("No installed package found matching input criteria."));
    }

    #[test]
    fn field_count_dispatch() {
        assert_eq!(
            record_from_fields(&["Git", "Git.Git", "2.43.0", "2.44.0", "winget"]),
            Some(PackageRecord::new("Git", "Git.Git", "2.43.0", "2.44.0"))
        );
        assert_eq!(
            record_from_fields(&["Git", "Git.Git", "2.43.0"]),
            Some(PackageRecord::new("Git", "Git.Git", "2.43.0", ""))
        );
        assert_eq!(
            record_from_fields(&["Git", "Git.Git"]),
            Some(PackageRecord::new("Git", "Git.Git", "", ""))
        );
        assert_eq!(record_from_fields(&["Git"]), None);
        assert_eq!(record_from_fields(&["--", "Git.Git", "1"]), None);
        assert_eq!(record_from_fields(&["Git", "-", "1"]), None);
        assert_eq!(record_from_fields(&["-", "|"]), None);
    }

    #[test]
    fn spinner_frames_are_dropped() {
        let raw = "\r   - \r   \\ \r   | \r\x1b[2KName  Id  Version\r\n----\r\nGit  Git.Git  2.43.0\r\n";
        assert_eq!(
            parse_list(raw),
            vec![PackageRecord::new("Git", "Git.Git", "2.43.0", "")]
        );
    }

    #[test]
    fn chinese_listing_end_to_end() {
        let raw = "名称              ID                 版本       可用       源\n\
                   ---------------------------------------------------------------\n\
                   Visual Studio Code  Microsoft.VisualStudioCode  1.85.0  1.86.1  winget\n\
                   7-Zip  7zip.7zip  22.01  23.01  winget\n\
                   3 升级可用。\n";
        let records = parse_list(raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "Microsoft.VisualStudioCode");
        assert_eq!(records[1].available, "23.01");
    }

    #[test]
    fn json_list_accepts_aliases() {
        let raw = r#"[
            {"Name": "Git", "Id": "Git.Git", "Version": "2.43.0", "AvailableVersion": "2.44.0"},
            {"PackageName": "7-Zip", "PackageIdentifier": "7zip.7zip", "InstalledVersion": 23},
            {"Name": "", "Id": ""}
        ]"#;
        let records = parse_json_list(raw, &FieldAliases::default()).unwrap();
        assert_eq!(
            records,
            vec![
                PackageRecord::new("Git", "Git.Git", "2.43.0", "2.44.0"),
                PackageRecord::new("7-Zip", "7zip.7zip", "23", ""),
            ]
        );
    }

    #[test]
    fn json_list_uses_configured_aliases() {
        let aliases = FieldAliases {
            name: vec!["title".into()],
            id: vec!["pkg".into()],
            ..FieldAliases::default()
        };
        let records = parse_json_list(r#"[{"title": "Foo", "pkg": "Foo.Bar"}]"#, &aliases).unwrap();
        assert_eq!(records, vec![PackageRecord::new("Foo", "Foo.Bar", "", "")]);
    }

    #[test]
    fn json_list_rejects_non_sequences() {
        let aliases = FieldAliases::default();
        assert!(matches!(
            parse_json_list("Name  Id  Version", &aliases),
            Err(WingetError::ParseFallback(_))
        ));
        assert!(matches!(
            parse_json_list(r#"{"Sources": []}"#, &aliases),
            Err(WingetError::ParseFallback(_))
        ));
    }
}

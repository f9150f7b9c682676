//! 安装目录推断
//!
//! 注册表里的 InstallLocation、UninstallString、DisplayIcon 往往带引号、带 `%VAR%`、
//! 混用 `/` 和 `\`，甚至是一整条命令行。这里把它们统一成 Windows 风格的绝对目录。
//! 路径按 Windows 语义处理，与宿主平台无关；文件系统探测通过 `PathProbe` 注入。
//! 每一步都不会失败，只会退化为 None。

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

const SEP: char = '\\';
const INSTALLER_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".msi", ".lnk"];

static PROCESS_ENV: OnceLock<Arc<EnvSnapshot>> = OnceLock::new();

/// 环境变量快照，键不区分大小写
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .filter(|(k, _)| !k.as_ref().is_empty())
            .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
            .collect();
        Self { vars }
    }

    pub fn capture() -> Self {
        Self::from_pairs(std::env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.to_string_lossy().into_owned()))
        }))
    }

    /// 当前进程的快照，首次使用时采集一次
    pub fn process() -> Arc<Self> {
        PROCESS_ENV
            .get_or_init(|| Arc::new(Self::capture()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&name.to_lowercase()).map(String::as_str)
    }

    /// 展开 `%NAME%` 占位符；找不到的变量原样保留
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(0) => {
                    out.push('%');
                    rest = after;
                }
                Some(end) => {
                    let name = &after[..end];
                    let token = name.trim();
                    let value = if token.is_empty() { None } else { self.get(token) };
                    match value {
                        Some(v) => out.push_str(v),
                        None => {
                            out.push('%');
                            out.push_str(name);
                            out.push('%');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// 文件系统探测
pub trait PathProbe {
    /// 路径不存在时返回 None
    fn kind(&self, path: &str) -> Option<EntryKind>;
}

/// 直接查询本机文件系统
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl PathProbe for FsProbe {
    fn kind(&self, path: &str) -> Option<EntryKind> {
        let meta = std::fs::metadata(path).ok()?;
        Some(if meta.is_file() {
            EntryKind::File
        } else {
            EntryKind::Dir
        })
    }
}

// ========== Windows 路径工具 ==========

/// 拆出根部分：`C:\`、`C:`、`\\server\share\`、`\` 或空串
fn split_root(path: &str) -> (String, &str) {
    if let Some(after) = path.strip_prefix("\\\\") {
        let mut parts = after.splitn(3, SEP);
        let server = parts.next().unwrap_or("");
        let share = parts.next().unwrap_or("");
        if !server.is_empty() && !share.is_empty() {
            let rest = parts.next().unwrap_or("");
            return (format!("\\\\{}\\{}\\", server, share), rest);
        }
        return ("\\".to_string(), path.trim_start_matches(SEP));
    }

    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        if bytes.get(2) == Some(&b'\\') {
            return (path[..3].to_string(), &path[3..]);
        }
        return (path[..2].to_string(), &path[2..]);
    }

    if let Some(rest) = path.strip_prefix(SEP) {
        return ("\\".to_string(), rest);
    }
    (String::new(), path)
}

/// `/` 转 `\`，折叠重复分隔符和 `.`/`..`
pub fn normalize_windows(path: &str) -> String {
    let path = path.replace('/', "\\");
    let (root, rest) = split_root(&path);
    let rooted = root.ends_with(SEP);

    let mut parts: Vec<&str> = Vec::new();
    for segment in rest.split(SEP) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }

    if root.is_empty() && parts.is_empty() {
        return ".".to_string();
    }
    let mut out = root;
    out.push_str(&parts.join("\\"));
    if !parts.is_empty() && rest.ends_with(SEP) {
        out.push(SEP);
    }
    out
}

/// 盘符根 (`C:\...`) 或 UNC (`\\...`)
pub fn is_absolute_windows(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'\\';
    drive || path.starts_with("\\\\")
}

fn parent_windows(path: &str) -> String {
    let (root, rest) = split_root(path);
    let rest = rest.trim_end_matches(SEP);
    match rest.rfind(SEP) {
        Some(i) => format!("{}{}", root, &rest[..i]),
        None => root,
    }
}

fn basename_windows(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEP);
    trimmed.rsplit(SEP).next().unwrap_or(trimmed)
}

fn has_installer_extension(name: &str) -> bool {
    let lower = name.to_lowercase();
    INSTALLER_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn drive_root(path: &str) -> Option<char> {
    let mut chars = path.chars();
    let letter = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    if chars.next() != Some(':') {
        return None;
    }
    match (chars.next(), chars.next()) {
        (None, _) | (Some('\\'), None) => Some(letter),
        _ => None,
    }
}

fn finalize_directory(path: &str) -> String {
    let normalized = normalize_windows(path);
    match drive_root(&normalized) {
        Some(letter) => format!("{}:\\", letter),
        None => normalized.trim_end_matches(SEP).to_string(),
    }
}

/// `,<数字>` 形式的图标索引后缀
fn strip_icon_index(s: &str) -> &str {
    if let Some(comma) = s.rfind(',') {
        let tail = s[comma + 1..].trim_start();
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return &s[..comma];
        }
    }
    s
}

/// 开头被双引号包住的片段
fn leading_quoted(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('"')?;
    let end = inner.find('"')?;
    (end > 0).then(|| &inner[..end])
}

// ========== 候选路径 ==========

/// 原始字符串的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateSource {
    InstallLocation,
    UninstallString,
    DisplayIcon,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCandidate {
    pub source: CandidateSource,
    pub raw: String,
    pub resolved: Option<String>,
    pub exists: bool,
}

pub struct PathResolver<P = FsProbe> {
    env: Arc<EnvSnapshot>,
    probe: P,
}

impl PathResolver<FsProbe> {
    pub fn new() -> Self {
        Self::with_parts(EnvSnapshot::process(), FsProbe)
    }
}

impl Default for PathResolver<FsProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PathProbe> PathResolver<P> {
    pub fn with_parts(env: Arc<EnvSnapshot>, probe: P) -> Self {
        Self { env, probe }
    }

    /// 去引号、展开变量、统一分隔符；结果为空时返回 None
    fn normalize_path_value(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        let unquoted = trimmed.trim_matches('"');
        let expanded = self.env.expand(unquoted);
        let normalized = normalize_windows(&expanded);
        let normalized = normalized.trim();
        (!normalized.is_empty()).then(|| normalized.to_string())
    }

    /// `known_file` 为 true 时无论能否探测到都按文件处理，取其所在目录
    fn resolve(&self, raw: &str, known_file: bool) -> Option<String> {
        let normalized = self.normalize_path_value(raw)?;
        if !is_absolute_windows(&normalized) {
            return None;
        }

        let candidate = if known_file {
            parent_windows(&normalized)
        } else {
            match self.probe.kind(&normalized) {
                Some(EntryKind::File) => parent_windows(&normalized),
                Some(EntryKind::Dir) => normalized,
                None if has_installer_extension(basename_windows(&normalized)) => {
                    parent_windows(&normalized)
                }
                None => normalized,
            }
        };

        Some(finalize_directory(&candidate))
    }

    /// 把路径字符串转为安装目录；指向文件时返回其上级目录
    pub fn resolve_install_directory(&self, raw: &str) -> Option<String> {
        self.resolve(raw, false)
    }

    /// 从卸载命令、图标路径等命令行字符串中推断安装目录
    pub fn derive_directory_from_command(&self, command: &str) -> Option<String> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lower = trimmed.to_lowercase();
        // msiexec 的第一个 token 永远不是有用的路径
        if lower.starts_with("msiexec") {
            return None;
        }

        let adjusted = strip_icon_index(trimmed);
        if let Some(token) = leading_quoted(adjusted) {
            return self.resolve(token, false);
        }

        if lower.starts_with("rundll32") {
            let args = adjusted.get("rundll32".len()..).unwrap_or("");
            let args = match args.get(..4) {
                Some(ext) if ext.eq_ignore_ascii_case(".exe") => &args[4..],
                _ => args,
            }
            .trim();
            if let Some(dll) = leading_quoted(args) {
                return self.resolve(dll, true);
            }
            let dll = args
                .split(|c: char| c == ',' || c.is_whitespace())
                .find(|t| !t.is_empty())?;
            return self.resolve(dll, true);
        }

        let first = adjusted.split_whitespace().next()?;
        self.resolve(strip_icon_index(first), false)
    }

    pub fn candidate(&self, source: CandidateSource, raw: &str) -> PathCandidate {
        let resolved = match source {
            CandidateSource::InstallLocation => self.resolve_install_directory(raw),
            _ => self.derive_directory_from_command(raw),
        };
        let exists = resolved
            .as_deref()
            .is_some_and(|p| self.probe.kind(p).is_some());
        PathCandidate {
            source,
            raw: raw.to_string(),
            resolved,
            exists,
        }
    }

    pub fn candidates<'a, I>(&self, raws: I) -> Vec<PathCandidate>
    where
        I: IntoIterator<Item = (CandidateSource, &'a str)>,
    {
        raws.into_iter()
            .map(|(source, raw)| self.candidate(source, raw))
            .collect()
    }

    /// 优先返回实际存在的候选，其次是第一个能解析出来的
    pub fn pick_install_directory<'a, I>(&self, raws: I) -> Option<PathCandidate>
    where
        I: IntoIterator<Item = (CandidateSource, &'a str)>,
    {
        let mut all = self.candidates(raws);
        let index = all
            .iter()
            .position(|c| c.exists)
            .or_else(|| all.iter().position(|c| c.resolved.is_some()))?;
        Some(all.swap_remove(index))
    }
}

/// 使用当前进程环境和本机文件系统解析安装目录
pub fn resolve_install_directory(raw: &str) -> Option<String> {
    PathResolver::new().resolve_install_directory(raw)
}

/// 使用当前进程环境和本机文件系统从命令行推断安装目录
pub fn derive_directory_from_command(command: &str) -> Option<String> {
    PathResolver::new().derive_directory_from_command(command)
}

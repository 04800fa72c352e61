//! Interpretation of the pipeline's console output.
//!
//! The pipeline logs `<timestamp> - <module> - <LEVEL> - <message>`. Lines
//! in that shape keep their module and level; anything else is attributed
//! to `stdout` with a level guessed from keywords. Stage markers in the
//! messages drive progress, and a few summary lines carry counters.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::domain::{LogLevel, RunMode, RunStats};

/// Module name for lines that are not in the structured format
pub const UNSTRUCTURED_MODULE: &str = "stdout";

/// Step label once the pipeline reports completion
pub const FINISHED_STEP: &str = "finished";

/// One console line split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub level: LogLevel,
    pub module: String,
    pub message: String,
}

/// Split a console line into level, module and message
pub fn parse_log_line(line: &str) -> ParsedLine {
    let clean = line.trim_end_matches(['\r', '\n']);

    if let Some(caps) = log_line_regex().captures(clean) {
        if let Ok(level) = caps["level"].parse::<LogLevel>() {
            return ParsedLine {
                level,
                module: caps["module"].to_string(),
                message: caps["message"].to_string(),
            };
        }
    }

    ParsedLine {
        level: guess_level(clean),
        module: UNSTRUCTURED_MODULE.to_string(),
        message: clean.to_string(),
    }
}

fn log_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<timestamp>\d{4}-\d{2}-\d{2} [0-9:,.]+) - (?P<module>[\w.]+) - (?P<level>[A-Z]+) - (?P<message>.*)$",
        )
        .expect("invalid regex")
    })
}

fn guess_level(line: &str) -> LogLevel {
    let lowered = line.to_lowercase();
    if ["error", "失败", "异常", "traceback"]
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        LogLevel::Error
    } else if ["warning", "warn", "警告"]
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}

/// A stage marker: when a message contains `marker`, the run moves to `step`
struct Stage {
    marker: &'static str,
    step: &'static str,
    progress: u8,
}

const DAILY_STAGES: &[Stage] = &[
    Stage { marker: "Step 1", step: "fetch sources", progress: 20 },
    Stage { marker: "Step 2", step: "filter content", progress: 40 },
    Stage { marker: "Step 3", step: "ai analysis", progress: 60 },
    Stage { marker: "Step 4", step: "update cache", progress: 80 },
    Stage { marker: "Step 5", step: "write report", progress: 92 },
];

const WEEKLY_STAGES: &[Stage] = &[
    Stage { marker: "开始生成 Weekly", step: "initialize", progress: 8 },
    Stage { marker: "共收集", step: "fetch complete", progress: 25 },
    Stage { marker: "处理文章", step: "ai extraction", progress: 45 },
    Stage { marker: "分类", step: "categorize", progress: 70 },
    Stage { marker: "Weekly 已保存到", step: "write report", progress: 92 },
    Stage { marker: "文件已保存到", step: "write report", progress: 92 },
];

/// The daily entry point prints `Dry-run模式`, the weekly generator `Dry-run 模式`
const COMPLETION_MARKERS: &[&str] = &["执行完成", "生成完成", "✅ 完成", "Dry-run 模式", "Dry-run模式"];

fn output_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:报告已保存到|Weekly 已保存到|文件已保存到):\s*(.+)$").expect("invalid regex")
    })
}

/// Counter extractors: regex plus the stats keys for its capture groups
fn stat_patterns() -> &'static [(Regex, &'static [&'static str])] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static [&'static str])>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(&str, &'static [&'static str]); 4] = [
            (r"共收集\s*(\d+)\s*篇唯一文章", &["unique_articles"]),
            (r"过滤后剩余\s*(\d+)\s*篇文章待处理", &["filtered_articles"]),
            (r"分析完成:\s*成功\s*(\d+)\s*/\s*(\d+)", &["ai_success", "ai_total"]),
            (r"已写入 Weekly 去重缓存:\s*(\d+)\s*条", &["dedup_written"]),
        ];
        table
            .into_iter()
            .map(|(pattern, keys)| (Regex::new(pattern).expect("invalid regex"), keys))
            .collect()
    })
}

fn category_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"分类\s+(.+?)\s+最终:\s*(\d+)\s*条").expect("invalid regex")
    })
}

/// What one message changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub step: Option<String>,
    pub progress: Option<u8>,
    pub output_path: Option<String>,
    pub stats: RunStats,
}

impl StageUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Follows a run's messages and keeps its progress monotonic
#[derive(Debug, Clone)]
pub struct StageTracker {
    mode: RunMode,
    progress: u8,
    step: String,
    output_path: Option<String>,
    stats: RunStats,
}

impl StageTracker {
    pub fn new(mode: RunMode, progress: u8, step: impl Into<String>) -> Self {
        Self {
            mode,
            progress,
            step: step.into(),
            output_path: None,
            stats: RunStats::new(),
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn output_path(&self) -> Option<&str> {
        self.output_path.as_deref()
    }

    /// Everything observed so far
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Interpret one message, updating the tracker
    pub fn observe(&mut self, message: &str) -> StageUpdate {
        let text = message.trim();
        let mut update = StageUpdate::default();
        if text.is_empty() {
            return update;
        }

        if let Some(caps) = output_path_regex().captures(text) {
            let path = caps[1].trim().to_string();
            self.output_path = Some(path.clone());
            update.output_path = Some(path);
        }

        let stages = match self.mode {
            RunMode::Daily => DAILY_STAGES,
            RunMode::Weekly => WEEKLY_STAGES,
        };
        for stage in stages {
            if text.contains(stage.marker) && stage.progress > self.progress {
                self.advance(stage.step, stage.progress, &mut update);
            }
        }

        if COMPLETION_MARKERS.iter().any(|marker| text.contains(marker)) && self.progress < 100 {
            self.advance(FINISHED_STEP, 100, &mut update);
        }

        for (regex, keys) in stat_patterns() {
            if let Some(caps) = regex.captures(text) {
                for (idx, key) in keys.iter().enumerate() {
                    if let Some(value) = caps.get(idx + 1).and_then(|m| m.as_str().parse::<u64>().ok()) {
                        update.stats.insert((*key).to_string(), json!(value));
                    }
                }
            }
        }

        if let Some(caps) = category_regex().captures(text) {
            if let Ok(count) = caps[2].parse::<u64>() {
                let mut categories = Map::new();
                categories.insert(caps[1].to_string(), json!(count));
                update
                    .stats
                    .insert("categories".to_string(), Value::Object(categories));
            }
        }

        crate::domain::merge_stats(&mut self.stats, update.stats.clone());
        update
    }

    fn advance(&mut self, step: &str, progress: u8, update: &mut StageUpdate) {
        self.progress = progress;
        self.step = step.to_string();
        update.step = Some(step.to_string());
        update.progress = Some(progress);
    }
}

//! 答题记录 CSV 日志
//!
//! 只追加，写入串行化；文件带 UTF-8 BOM 方便 Excel 直接打开。

pub mod query;

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

const BOM: &str = "\u{feff}";

pub const HEADERS: [&str; 17] = [
    "时间戳",
    "题型",
    "题目",
    "选项",
    "原始回答",
    "思考过程",
    "处理后答案",
    "AI耗时(秒)",
    "总耗时(秒)",
    "模型",
    "思考模式",
    "输入Token",
    "输出Token",
    "总Token",
    "费用(元)",
    "提供商",
    "模型ID",
];

/// 一行答题记录。序列化结果与 CSV 中的文本完全一致，接口直接返回
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerRecord {
    #[serde(rename = "时间戳")]
    pub timestamp: String,
    /// 题型中文名
    #[serde(rename = "题型")]
    pub question_type: String,
    #[serde(rename = "题目")]
    pub question: String,
    /// 选项以 " | " 连接
    #[serde(rename = "选项")]
    pub options: String,
    #[serde(rename = "原始回答")]
    pub raw_answer: String,
    #[serde(rename = "思考过程")]
    pub reasoning_content: String,
    #[serde(rename = "处理后答案")]
    pub answer: String,
    #[serde(rename = "AI耗时(秒)", with = "seconds")]
    pub ai_time: f64,
    #[serde(rename = "总耗时(秒)", with = "seconds")]
    pub total_time: f64,
    #[serde(rename = "模型")]
    pub model: String,
    #[serde(rename = "思考模式", with = "yes_no")]
    pub reasoning_used: bool,
    #[serde(rename = "输入Token", with = "tokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "输出Token", with = "tokens")]
    pub completion_tokens: u64,
    #[serde(rename = "总Token", with = "tokens")]
    pub total_tokens: u64,
    #[serde(rename = "费用(元)", with = "cost")]
    pub cost: f64,
    /// 厂商名，大写
    #[serde(rename = "提供商")]
    pub provider: String,
    #[serde(rename = "模型ID")]
    pub model_id: String,
}

impl AnswerRecord {
    pub fn now_timestamp() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn join_options(options: &[String]) -> String {
        options.join(" | ")
    }

    /// 与 CSV 中一致的各列文本，用于全文搜索
    pub fn row(&self) -> [String; 17] {
        [
            self.timestamp.clone(),
            self.question_type.clone(),
            self.question.clone(),
            self.options.clone(),
            self.raw_answer.clone(),
            self.reasoning_content.clone(),
            self.answer.clone(),
            seconds::format(self.ai_time),
            seconds::format(self.total_time),
            self.model.clone(),
            yes_no::format(self.reasoning_used).to_string(),
            self.prompt_tokens.to_string(),
            self.completion_tokens.to_string(),
            self.total_tokens.to_string(),
            cost::format(self.cost),
            self.provider.clone(),
            self.model_id.clone(),
        ]
    }

    /// 记录日期（时间戳的日期部分），无法解析时返回 None
    pub fn date(&self) -> Option<chrono::NaiveDate> {
        let day = self.timestamp.split_whitespace().next()?;
        chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(String::deserialize(d)?.trim().to_string())
}

mod seconds {
    use super::*;

    pub fn format(v: f64) -> String {
        format!("{:.2}", v)
    }
    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(lenient_string(d)?.parse().unwrap_or(0.0))
    }
}

mod cost {
    use super::*;

    pub fn format(v: f64) -> String {
        format!("{:.6}", v)
    }
    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(lenient_string(d)?.parse().unwrap_or(0.0))
    }
}

mod tokens {
    use super::*;

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = lenient_string(d)?;
        Ok(raw
            .parse::<u64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0))
    }
}

mod yes_no {
    use super::*;

    pub fn format(v: bool) -> &'static str {
        if v { "是" } else { "否" }
    }
    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(format(*v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let raw = lenient_string(d)?;
        Ok(matches!(raw.as_str(), "是" | "true" | "True" | "1"))
    }
}

/// CSV 日志文件，写操作经由互斥锁串行
#[derive(Debug)]
pub struct AnswerLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AnswerLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 追加一条记录；文件不存在或为空时先写 BOM 和表头
    pub fn append(&self, record: &AnswerRecord) -> Result<()> {
        let _guard = self.guard();

        self.repair_header()?;
        let fresh = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("打开 CSV 文件失败: {:?}", self.path))?;
        if fresh {
            file.write_all(BOM.as_bytes())?;
        }

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(HEADERS)?;
        }
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    /// 清空记录，只保留表头
    pub fn clear(&self) -> Result<()> {
        let _guard = self.guard();
        self.write_rows(std::iter::empty::<Vec<String>>())
            .with_context(|| format!("清空 CSV 文件失败: {:?}", self.path))?;
        info!("CSV文件已清空: {:?}", self.path);
        Ok(())
    }

    fn write_rows<I, R>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator,
        R::Item: AsRef<[u8]>,
    {
        let mut file = fs::File::create(&self.path)?;
        file.write_all(BOM.as_bytes())?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADERS)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn read_content(&self) -> Result<String> {
        let content =
            fs::read_to_string(&self.path).with_context(|| format!("读取 CSV 文件失败: {:?}", self.path))?;
        Ok(content
            .strip_prefix(BOM)
            .map(str::to_string)
            .unwrap_or(content))
    }

    /// 只读第一行；文件不存在或为空时返回 None
    fn read_header(&self) -> Result<Option<csv::StringRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("打开 CSV 文件失败: {:?}", self.path)),
        };
        let mut input = BufReader::new(file);
        if input.fill_buf()?.starts_with(BOM.as_bytes()) {
            input.consume(BOM.len());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        let mut header = csv::StringRecord::new();
        if !reader.read_record(&mut header)? {
            return Ok(None);
        }
        Ok(Some(header))
    }

    /// 表头与当前列不一致时：备份为 .backup，按新表头补齐或截断每一行
    fn repair_header(&self) -> Result<()> {
        let Some(header) = self.read_header()? else {
            return Ok(());
        };
        if header.iter().eq(HEADERS.iter().copied()) {
            return Ok(());
        }

        warn!(
            "CSV文件表头不正确，当前列数: {}, 正确列数: {}",
            header.len(),
            HEADERS.len()
        );
        let backup = PathBuf::from(format!("{}.backup", self.path.display()));
        fs::copy(&self.path, &backup).with_context(|| format!("备份 CSV 文件失败: {:?}", backup))?;
        info!("已备份到: {:?}", backup);

        let content = self.read_content()?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(content.as_bytes());
        let mut rows = Vec::new();
        for record in reader.records().skip(1) {
            let record = record?;
            let mut row: Vec<String> = record.iter().take(HEADERS.len()).map(str::to_string).collect();
            row.resize(HEADERS.len(), String::new());
            rows.push(row);
        }
        let count = rows.len();
        self.write_rows(rows)?;
        info!("CSV文件表头修复完成，共处理 {} 行数据", count);
        Ok(())
    }

    /// 读取全部记录；文件不存在时返回 None，无法解析的行跳过
    pub fn read_all(&self) -> Result<Option<Vec<AnswerRecord>>> {
        if !self.exists() {
            return Ok(None);
        }
        let content = self.read_content()?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());

        let mut records = Vec::new();
        for (i, result) in reader.deserialize::<AnswerRecord>().enumerate() {
            match result {
                Ok(record) => records.push(record),
                Err(e) => warn!("跳过无法解析的 CSV 行 {}: {}", i + 2, e),
            }
        }
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(timestamp: &str, q_type: &str, ai_time: f64, reasoning: bool) -> AnswerRecord {
        AnswerRecord {
            timestamp: timestamp.to_string(),
            question_type: q_type.to_string(),
            question: format!("{} 的题目", timestamp),
            options: AnswerRecord::join_options(&["甲".to_string(), "乙, 丙".to_string()]),
            raw_answer: "甲".to_string(),
            answer: "甲".to_string(),
            ai_time,
            total_time: ai_time + 0.5,
            model: "deepseek-chat".to_string(),
            reasoning_used: reasoning,
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
            cost: 0.00026,
            provider: "DEEPSEEK".to_string(),
            model_id: "system_deepseek_chat".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_append_writes_bom_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnswerLog::new(dir.path().join("log.csv"));

        log.append(&record("2026-01-02 10:00:00", "单选题", 1.234, false)).unwrap();
        log.append(&record("2026-01-03 10:00:00", "多选题", 3.0, true)).unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert!(raw.starts_with(BOM));
        assert_eq!(raw.matches(BOM).count(), 1);
        let first_line = raw.trim_start_matches(BOM).lines().next().unwrap();
        assert_eq!(first_line, HEADERS.join(","));
        assert!(raw.contains("\"甲 | 乙, 丙\""));
        assert!(raw.contains(",1.23,1.73,"));
        assert!(raw.contains(",0.000260,"));

        let records = log.read_all().unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ai_time, 1.23);
        assert!(!records[0].reasoning_used);
        assert!(records[1].reasoning_used);
        assert_eq!(records[1].total_tokens, 120);
    }

    #[test]
    fn test_header_repair_pads_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        // 旧版 16 列文件，没有 模型ID
        let old_header = HEADERS[..16].join(",");
        fs::write(
            &path,
            format!(
                "{BOM}{old_header}\n2026-01-01 08:00:00,判断题,q,,正确,,正确,1.00,1.50,deepseek-chat,否,10,2,12,0.000026,DEEPSEEK\n"
            ),
        )
        .unwrap();

        let log = AnswerLog::new(&path);
        log.append(&record("2026-01-02 10:00:00", "单选题", 1.0, false)).unwrap();

        assert!(dir.path().join("log.csv.backup").exists());
        let records = log.read_all().unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].question_type, "判断题");
        assert_eq!(records[0].model_id, "");
        assert_eq!(records[1].model_id, "system_deepseek_chat");
    }

    #[test]
    fn test_append_only_checks_header_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let log = AnswerLog::new(&path);
        log.append(&record("2026-01-02 10:00:00", "单选题", 1.0, false)).unwrap();

        // 表头之后的内容不影响追加，哪怕不是合法 UTF-8
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\xff\xfe broken row\n").unwrap();
        drop(file);

        log.append(&record("2026-01-03 10:00:00", "多选题", 2.0, true)).unwrap();
        assert!(!dir.path().join("log.csv.backup").exists());

        let raw = fs::read(&path).unwrap();
        assert!(raw.starts_with(BOM.as_bytes()));
        assert!(raw.ends_with(b"\n"));
        assert_eq!(raw.windows(BOM.len()).filter(|w| *w == BOM.as_bytes()).count(), 1);
    }

    #[test]
    fn test_clear_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnswerLog::new(dir.path().join("log.csv"));
        log.append(&record("2026-01-02 10:00:00", "单选题", 1.0, false)).unwrap();
        log.clear().unwrap();

        assert_eq!(log.read_all().unwrap().unwrap().len(), 0);
        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.trim_start_matches(BOM).trim_end(), HEADERS.join(","));
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnswerLog::new(dir.path().join("none.csv"));
        assert!(log.read_all().unwrap().is_none());
    }

    #[test]
    fn test_lenient_numbers() {
        let csv_text = format!("{}\n,单选题,q,,,,,abc,,m,是,1.0,,x,,,\n", HEADERS.join(","));
        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let rec: AnswerRecord = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(rec.ai_time, 0.0);
        assert_eq!(rec.prompt_tokens, 1);
        assert_eq!(rec.total_tokens, 0);
        assert!(rec.reasoning_used);
        assert!(rec.date().is_none());
    }
}

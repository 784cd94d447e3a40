//! 日志查询：筛选、分页与统计
//!
//! 每次查询都重新扫描整个文件，不做索引。

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use super::AnswerRecord;
use crate::app::question::QuestionType;

/// 查询参数中的筛选条件，各条件之间为“且”
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub search: String,
    #[serde(rename = "type")]
    pub question_type: String,
    pub reasoning: String,
    pub date: String,
    pub custom_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRange {
    All,
    Today,
    /// 最近 7 天
    Week,
    /// 最近 30 天
    Month,
    /// 闭区间
    Custom(NaiveDate, NaiveDate),
}

impl LogFilter {
    pub fn date_range(&self) -> DateRange {
        match self.date.trim() {
            "today" => DateRange::Today,
            "week" => DateRange::Week,
            "month" => DateRange::Month,
            "custom" => {
                let parts: Vec<&str> = self.custom_date.split(',').map(str::trim).collect();
                match parts.as_slice() {
                    [start, end] => match (
                        NaiveDate::parse_from_str(start, "%Y-%m-%d"),
                        NaiveDate::parse_from_str(end, "%Y-%m-%d"),
                    ) {
                        (Ok(s), Ok(e)) => DateRange::Custom(s, e),
                        _ => DateRange::All,
                    },
                    _ => DateRange::All,
                }
            }
            _ => DateRange::All,
        }
    }

    /// 题型条件统一成中文名；无法识别时按原文比较
    fn type_name(&self) -> Option<String> {
        let raw = self.question_type.trim();
        if raw.is_empty() {
            return None;
        }
        let parsed = raw
            .parse::<i64>()
            .ok()
            .and_then(QuestionType::from_code)
            .or_else(|| QuestionType::parse(raw));
        Some(parsed.map(|t| t.name().to_string()).unwrap_or_else(|| raw.to_string()))
    }

    fn reasoning_flag(&self) -> Option<bool> {
        match self.reasoning.trim() {
            "思考模式" | "是" | "true" => Some(true),
            "普通模式" | "否" | "false" => Some(false),
            _ => None,
        }
    }

    pub fn matches(&self, record: &AnswerRecord, today: NaiveDate) -> bool {
        let search = self.search.trim().to_lowercase();
        if !search.is_empty() && !record.row().iter().any(|f| f.to_lowercase().contains(&search)) {
            return false;
        }
        if let Some(name) = self.type_name() {
            if record.question_type != name {
                return false;
            }
        }
        if let Some(flag) = self.reasoning_flag() {
            if record.reasoning_used != flag {
                return false;
            }
        }

        // 时间戳无法解析的行不参与日期筛选
        let Some(day) = record.date() else {
            return true;
        };
        match self.date_range() {
            DateRange::All => true,
            DateRange::Today => day == today,
            DateRange::Week => day >= today - Duration::days(7),
            DateRange::Month => day >= today - Duration::days(30),
            DateRange::Custom(start, end) => start <= day && day <= end,
        }
    }
}

/// 筛选并按时间倒序排列（稳定排序，同一时间戳保持文件顺序）
pub fn select(records: Vec<AnswerRecord>, filter: &LogFilter, today: NaiveDate) -> Vec<AnswerRecord> {
    let mut rows: Vec<AnswerRecord> = records
        .into_iter()
        .filter(|r| filter.matches(r, today))
        .collect();
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    rows
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PageParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub export: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Page {
    pub data: Vec<AnswerRecord>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
}

/// page 从 1 开始；缺少分页参数或 export=true 时返回全部
pub fn paginate(rows: Vec<AnswerRecord>, params: &PageParams) -> Page {
    let total = rows.len();
    let export = params.export.as_deref() == Some("true");

    let (page, page_size) = match (params.page, params.page_size) {
        (Some(p), Some(s)) if !export => (p, s),
        _ => {
            return Page {
                data: rows,
                total,
                page: None,
                page_size: None,
                total_pages: None,
            };
        }
    };

    let total_pages = if page_size == 0 { 0 } else { total.div_ceil(page_size) };
    let data = if page == 0 || page_size == 0 {
        Vec::new()
    } else {
        rows.into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect()
    };

    Page {
        data,
        total,
        page: Some(page),
        page_size: Some(page_size),
        total_pages: Some(total_pages),
    }
}

/// 统计面板数据
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: usize,
    /// 平均 AI 耗时（秒）
    pub avg_time: f64,
    pub reasoning_count: usize,
    /// 总耗时（分钟）
    pub total_time: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub type_counts: BTreeMap<String, usize>,
    pub time_ranges: BTreeMap<String, usize>,
    pub reasoning_counts: BTreeMap<String, usize>,
    pub daily_counts: BTreeMap<String, usize>,
}

const TIME_RANGES: [&str; 4] = ["0-2秒", "2-5秒", "5-10秒", "10秒以上"];

fn time_range(ai_time: f64) -> &'static str {
    if ai_time <= 2.0 {
        TIME_RANGES[0]
    } else if ai_time <= 5.0 {
        TIME_RANGES[1]
    } else if ai_time <= 10.0 {
        TIME_RANGES[2]
    } else {
        TIME_RANGES[3]
    }
}

pub fn stats(rows: &[AnswerRecord]) -> LogStats {
    let mut stats = LogStats {
        total: rows.len(),
        avg_time: 0.0,
        reasoning_count: 0,
        total_time: 0.0,
        total_cost: 0.0,
        total_tokens: 0,
        input_tokens: 0,
        output_tokens: 0,
        type_counts: BTreeMap::new(),
        time_ranges: TIME_RANGES.iter().map(|k| (k.to_string(), 0)).collect(),
        reasoning_counts: [("思考模式".to_string(), 0), ("普通模式".to_string(), 0)].into(),
        daily_counts: BTreeMap::new(),
    };

    let mut ai_time_sum = 0.0;
    for row in rows {
        ai_time_sum += row.ai_time;
        stats.total_time += row.total_time;
        stats.total_cost += row.cost;
        stats.total_tokens += row.total_tokens;
        stats.input_tokens += row.prompt_tokens;
        stats.output_tokens += row.completion_tokens;

        let mode = if row.reasoning_used {
            stats.reasoning_count += 1;
            "思考模式"
        } else {
            "普通模式"
        };
        *stats.reasoning_counts.entry(mode.to_string()).or_default() += 1;

        let q_type = if row.question_type.is_empty() { "未知" } else { row.question_type.as_str() };
        *stats.type_counts.entry(q_type.to_string()).or_default() += 1;
        *stats.time_ranges.entry(time_range(row.ai_time).to_string()).or_default() += 1;

        if let Some(day) = row.timestamp.split_whitespace().next() {
            *stats.daily_counts.entry(day.to_string()).or_default() += 1;
        }
    }

    if stats.total > 0 {
        stats.avg_time = ai_time_sum / stats.total as f64;
        stats.total_time /= 60.0;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::answer_log::tests::record;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 31).unwrap()
    }

    fn fixture() -> Vec<AnswerRecord> {
        let mut rows = vec![
            record("2026-03-31 09:00:00", "单选题", 1.0, false),
            record("2026-03-30 09:00:00", "多选题", 4.0, true),
            record("2026-03-31 09:00:00", "多选题", 6.0, true),
            record("2026-03-20 12:00:00", "判断题", 12.0, false),
            record("2026-01-15 12:00:00", "单选题", 2.0, false),
            record("坏时间", "填空题", 3.0, false),
        ];
        rows[0].question = "光合作用的场所".to_string();
        rows[2].question = "选出所有惰性气体".to_string();
        rows
    }

    fn filter(f: impl FnOnce(&mut LogFilter)) -> LogFilter {
        let mut filter = LogFilter::default();
        f(&mut filter);
        filter
    }

    fn timestamps(rows: &[AnswerRecord]) -> Vec<&str> {
        rows.iter().map(|r| r.timestamp.as_str()).collect()
    }

    #[test]
    fn test_date_range_parsing() {
        assert_eq!(filter(|f| f.date = "week".into()).date_range(), DateRange::Week);
        assert_eq!(
            filter(|f| {
                f.date = "custom".into();
                f.custom_date = "2026-03-01,2026-03-20".into();
            })
            .date_range(),
            DateRange::Custom(
                NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 3, 20).unwrap()
            )
        );
        assert_eq!(
            filter(|f| {
                f.date = "custom".into();
                f.custom_date = "2026-03-01".into();
            })
            .date_range(),
            DateRange::All
        );
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let by_type = filter(|f| f.question_type = "多选题".into());
        assert_eq!(select(fixture(), &by_type, today()).len(), 2);

        let by_code = filter(|f| f.question_type = "1".into());
        assert_eq!(select(fixture(), &by_code, today()).len(), 2);

        let type_and_today = filter(|f| {
            f.question_type = "multiple".into();
            f.date = "today".into();
        });
        assert_eq!(
            timestamps(&select(fixture(), &type_and_today, today())),
            vec!["2026-03-31 09:00:00"]
        );

        let search_and_reasoning = filter(|f| {
            f.search = "惰性".into();
            f.reasoning = "普通模式".into();
        });
        assert!(select(fixture(), &search_and_reasoning, today()).is_empty());

        let search_and_reasoning = filter(|f| {
            f.search = "惰性".into();
            f.reasoning = "是".into();
        });
        assert_eq!(select(fixture(), &search_and_reasoning, today()).len(), 1);
    }

    #[test]
    fn test_search_is_case_insensitive_over_all_fields() {
        let f = filter(|f| f.search = "DEEPSEEK-CHAT".into());
        assert_eq!(select(fixture(), &f, today()).len(), 6);
        let f = filter(|f| f.search = "system_deepseek".into());
        assert_eq!(select(fixture(), &f, today()).len(), 6);
        let f = filter(|f| f.search = "光合".into());
        assert_eq!(select(fixture(), &f, today()).len(), 1);
    }

    #[test]
    fn test_date_filters() {
        // 时间戳无法解析的行保留
        let week = filter(|f| f.date = "week".into());
        assert_eq!(select(fixture(), &week, today()).len(), 3 + 1);

        let month = filter(|f| f.date = "month".into());
        assert_eq!(select(fixture(), &month, today()).len(), 4 + 1);

        let custom = filter(|f| {
            f.date = "custom".into();
            f.custom_date = "2026-01-15,2026-03-20".into();
        });
        assert_eq!(select(fixture(), &custom, today()).len(), 2 + 1);
    }

    #[test]
    fn test_sorted_newest_first_and_stable() {
        let rows = select(fixture(), &LogFilter::default(), today());
        assert_eq!(
            timestamps(&rows),
            vec![
                "坏时间",
                "2026-03-31 09:00:00",
                "2026-03-31 09:00:00",
                "2026-03-30 09:00:00",
                "2026-03-20 12:00:00",
                "2026-01-15 12:00:00",
            ]
        );
        // 相同时间戳保持文件顺序
        assert_eq!(rows[1].question_type, "单选题");
        assert_eq!(rows[2].question_type, "多选题");
    }

    #[test]
    fn test_pagination_is_stable() {
        let all = select(fixture(), &LogFilter::default(), today());
        let params = |page| PageParams {
            page: Some(page),
            page_size: Some(4),
            export: None,
        };

        let p1 = paginate(all.clone(), &params(1));
        let p2 = paginate(all.clone(), &params(2));
        let p3 = paginate(all.clone(), &params(3));

        assert_eq!(p1.total, 6);
        assert_eq!(p1.total_pages, Some(2));
        assert_eq!(p1.data.len(), 4);
        assert_eq!(p2.data.len(), 2);
        assert!(p3.data.is_empty());

        let mut joined = p1.data.clone();
        joined.extend(p2.data);
        assert_eq!(joined, all);

        // 同样的查询再跑一次，分页结果一致
        let again = paginate(select(fixture(), &LogFilter::default(), today()), &params(1));
        assert_eq!(again.data, p1.data);
    }

    #[test]
    fn test_pagination_without_params_or_export() {
        let all = select(fixture(), &LogFilter::default(), today());
        let page = paginate(all.clone(), &PageParams::default());
        assert_eq!(page.data.len(), 6);
        assert!(page.total_pages.is_none());

        let export = paginate(
            all,
            &PageParams {
                page: Some(1),
                page_size: Some(2),
                export: Some("true".into()),
            },
        );
        assert_eq!(export.data.len(), 6);
        assert!(export.page.is_none());
    }

    #[test]
    fn test_stats_match_hand_computed_fixture() {
        let s = stats(&fixture());

        // ai_time: 1 + 4 + 6 + 12 + 2 + 3 = 28；total_time 每行 +0.5 → 31 秒
        assert_eq!(s.total, 6);
        assert!((s.avg_time - 28.0 / 6.0).abs() < 1e-9);
        assert!((s.total_time - 31.0 / 60.0).abs() < 1e-9);
        assert_eq!(s.reasoning_count, 2);
        assert_eq!(s.total_tokens, 720);
        assert_eq!(s.input_tokens, 600);
        assert_eq!(s.output_tokens, 120);
        assert!((s.total_cost - 0.00156).abs() < 1e-9);

        assert_eq!(s.type_counts["单选题"], 2);
        assert_eq!(s.type_counts["多选题"], 2);
        assert_eq!(s.type_counts["判断题"], 1);
        assert_eq!(s.type_counts["填空题"], 1);

        assert_eq!(s.time_ranges["0-2秒"], 2);
        assert_eq!(s.time_ranges["2-5秒"], 2);
        assert_eq!(s.time_ranges["5-10秒"], 1);
        assert_eq!(s.time_ranges["10秒以上"], 1);

        assert_eq!(s.reasoning_counts["思考模式"], 2);
        assert_eq!(s.reasoning_counts["普通模式"], 4);

        assert_eq!(s.daily_counts["2026-03-31"], 2);
        assert_eq!(s.daily_counts["坏时间"], 1);
        assert_eq!(s.daily_counts.len(), 5);
    }

    #[test]
    fn test_stats_on_empty() {
        let s = stats(&[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.avg_time, 0.0);
        assert_eq!(s.time_ranges.len(), 4);
    }
}

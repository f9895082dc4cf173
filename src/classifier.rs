//! Failure Classification
//!
//! Two independent keyword taxonomies over raw error text:
//! - correction categories, which drive the correction strategy
//! - recovery categories, which carry recoverability and a default hint
//!
//! Rules are ordered tables; the first category with a matching keyword wins.
//! Matching runs over the lower-cased concatenation of all supplied fragments.
//! Classification never fails: anything unrecognized is `Unknown`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correction taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Retrieved data is missing or incomplete
    DataInsufficient,
    /// Output or input could not be parsed / has the wrong shape
    FormatError,
    /// Reasoning over the data produced a wrong result
    AnalysisError,
    /// Contradictory or inconsistent conclusions
    LogicError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        Self::DataInsufficient,
        Self::FormatError,
        Self::AnalysisError,
        Self::LogicError,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataInsufficient => "DATA_INSUFFICIENT",
            Self::FormatError => "FORMAT_ERROR",
            Self::AnalysisError => "ANALYSIS_ERROR",
            Self::LogicError => "LOGIC_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CORRECTION_RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::DataInsufficient,
        &[
            "数据不完整",
            "数据不足",
            "缺少数据",
            "缺失数据",
            "数据为空",
            "没有数据",
            "无数据",
            "insufficient data",
            "incomplete data",
            "missing data",
            "not enough data",
            "no data",
            "empty result",
        ],
    ),
    (
        ErrorCategory::FormatError,
        &[
            "格式错误",
            "格式不正确",
            "解析失败",
            "format error",
            "invalid format",
            "wrong format",
            "malformed",
            "parse error",
            "failed to parse",
            "unexpected token",
            "invalid json",
        ],
    ),
    (
        ErrorCategory::AnalysisError,
        &[
            "分析错误",
            "分析失败",
            "计算错误",
            "analysis error",
            "analysis failed",
            "calculation error",
            "miscalculat",
            "incorrect result",
            "wrong result",
        ],
    ),
    (
        ErrorCategory::LogicError,
        &[
            "逻辑错误",
            "逻辑矛盾",
            "矛盾",
            "不一致",
            "logic error",
            "logical error",
            "contradict",
            "inconsistent",
            "infinite loop",
        ],
    ),
];

/// Recovery taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryCategory {
    ParameterError,
    PermissionError,
    ServiceUnavailable,
    DataNotFound,
    ValidationError,
    BusinessError,
    ResourceConflict,
    Unknown,
}

/// Static metadata attached to a recovery category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryInfo {
    pub recoverable: bool,
    pub description: &'static str,
    pub hint: &'static str,
}

impl RecoveryCategory {
    pub const ALL: [RecoveryCategory; 8] = [
        Self::ParameterError,
        Self::PermissionError,
        Self::ServiceUnavailable,
        Self::DataNotFound,
        Self::ValidationError,
        Self::BusinessError,
        Self::ResourceConflict,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParameterError => "PARAMETER_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::DataNotFound => "DATA_NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BusinessError => "BUSINESS_ERROR",
            Self::ResourceConflict => "RESOURCE_CONFLICT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn info(&self) -> CategoryInfo {
        match self {
            Self::ParameterError => CategoryInfo {
                recoverable: true,
                description: "Tool parameters are missing, misnamed or malformed",
                hint: "Check required parameters and their names, then call again with corrected values",
            },
            Self::PermissionError => CategoryInfo {
                recoverable: false,
                description: "The caller lacks permission or valid credentials",
                hint: "Ask the user or an administrator to grant access; retrying will not help",
            },
            Self::ServiceUnavailable => CategoryInfo {
                recoverable: true,
                description: "The backing service is down, overloaded or timed out",
                hint: "Retry later or switch to an alternative tool that serves the same data",
            },
            Self::DataNotFound => CategoryInfo {
                recoverable: true,
                description: "The requested record or resource does not exist",
                hint: "Verify identifiers and filters, or widen the query range",
            },
            Self::ValidationError => CategoryInfo {
                recoverable: true,
                description: "Parameter values were rejected by validation rules",
                hint: "Adjust values to the allowed range and format before retrying",
            },
            Self::BusinessError => CategoryInfo {
                recoverable: true,
                description: "The request violates a business rule in the current state",
                hint: "Check preconditions of the operation and change the request accordingly",
            },
            Self::ResourceConflict => CategoryInfo {
                recoverable: true,
                description: "The resource already exists or is being modified concurrently",
                hint: "Reload the current state of the resource and retry with fresh data",
            },
            Self::Unknown => CategoryInfo {
                recoverable: true,
                description: "The failure did not match any known category",
                hint: "Inspect the error message and retry with adjusted parameters",
            },
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.info().recoverable
    }

    pub fn description(&self) -> &'static str {
        self.info().description
    }

    pub fn hint(&self) -> &'static str {
        self.info().hint
    }
}

impl fmt::Display for RecoveryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const RECOVERY_RULES: &[(RecoveryCategory, &[&str])] = &[
    (
        RecoveryCategory::ParameterError,
        &[
            "参数错误",
            "参数缺失",
            "缺少参数",
            "参数无效",
            "invalid parameter",
            "missing parameter",
            "invalid argument",
            "missing argument",
            "required parameter",
            "required field",
            "unknown parameter",
        ],
    ),
    (
        RecoveryCategory::PermissionError,
        &[
            "权限",
            "无权",
            "未授权",
            "禁止访问",
            "permission",
            "unauthorized",
            "forbidden",
            "access denied",
            "401",
            "403",
        ],
    ),
    (
        RecoveryCategory::ServiceUnavailable,
        &[
            "服务不可用",
            "服务异常",
            "超时",
            "连接失败",
            "unavailable",
            "timeout",
            "timed out",
            "connection refused",
            "connection reset",
            "502",
            "503",
            "504",
        ],
    ),
    (
        RecoveryCategory::DataNotFound,
        &[
            "不存在",
            "未找到",
            "找不到",
            "not found",
            "no such",
            "does not exist",
            "404",
        ],
    ),
    (
        RecoveryCategory::ValidationError,
        &[
            "校验失败",
            "验证失败",
            "不合法",
            "validation",
            "invalid",
            "out of range",
            "must be",
        ],
    ),
    (
        RecoveryCategory::BusinessError,
        &[
            "业务",
            "余额不足",
            "不允许",
            "business rule",
            "not allowed",
            "insufficient balance",
            "quota exceeded",
        ],
    ),
    (
        RecoveryCategory::ResourceConflict,
        &[
            "冲突",
            "已存在",
            "重复",
            "conflict",
            "already exists",
            "duplicate",
            "409",
            "locked",
        ],
    ),
];

/// Lower-cased, space-joined text of all non-blank fragments
fn haystack(fragments: &[Option<&str>]) -> Option<String> {
    let joined = fragments
        .iter()
        .flatten()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

/// Substring match; numeric keywords (status codes) must stand alone
fn contains_keyword(text: &str, keyword: &str) -> bool {
    if !keyword.bytes().all(|b| b.is_ascii_digit()) {
        return text.contains(keyword);
    }

    let bytes = text.as_bytes();
    text.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = start.checked_sub(1).map(|i| bytes[i]);
        let after = bytes.get(end).copied();
        !before.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
            && !after.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

fn first_match<C: Copy>(rules: &[(C, &[&str])], text: &str) -> Option<C> {
    rules
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| contains_keyword(text, k)))
        .map(|(category, _)| *category)
}

/// Classify an error into the correction taxonomy
///
/// `auxiliary` is any extra text (error type, tool output) to match alongside
/// the message.
pub fn classify_error(message: Option<&str>, auxiliary: Option<&str>) -> ErrorCategory {
    haystack(&[message, auxiliary])
        .and_then(|text| first_match(CORRECTION_RULES, &text))
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classify an error into the recovery taxonomy
pub fn classify_recovery(message: Option<&str>, auxiliary: Option<&str>) -> RecoveryCategory {
    haystack(&[message, auxiliary])
        .and_then(|text| first_match(RECOVERY_RULES, &text))
        .unwrap_or(RecoveryCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_classification() {
        assert_eq!(classify_error(Some("数据不完整"), None), ErrorCategory::DataInsufficient);
        assert_eq!(classify_error(Some("Failed to parse JSON output"), None), ErrorCategory::FormatError);
        assert_eq!(classify_error(Some("分析失败: 指标计算错误"), None), ErrorCategory::AnalysisError);
        assert_eq!(classify_error(Some("Conclusion contradicts the source"), None), ErrorCategory::LogicError);
        assert_eq!(classify_error(Some("something weird"), None), ErrorCategory::Unknown);
    }

    #[test]
    fn test_blank_input_is_unknown() {
        assert_eq!(classify_error(None, None), ErrorCategory::Unknown);
        assert_eq!(classify_error(Some(""), None), ErrorCategory::Unknown);
        assert_eq!(classify_error(Some("   \n\t"), Some("  ")), ErrorCategory::Unknown);
        assert_eq!(classify_recovery(None, None), RecoveryCategory::Unknown);
    }

    #[test]
    fn test_priority_order() {
        // Both data and format keywords present: data wins
        let msg = "insufficient data and invalid format";
        assert_eq!(classify_error(Some(msg), None), ErrorCategory::DataInsufficient);

        // Parameter error outranks generic validation wording
        let msg = "Invalid parameter: start_date";
        assert_eq!(classify_recovery(Some(msg), None), RecoveryCategory::ParameterError);
    }

    #[test]
    fn test_auxiliary_text_is_matched() {
        assert_eq!(
            classify_error(Some("tool returned nothing useful"), Some("MALFORMED response")),
            ErrorCategory::FormatError
        );
        assert_eq!(
            classify_recovery(Some("request failed"), Some("HTTP 503")),
            RecoveryCategory::ServiceUnavailable
        );
    }

    #[test]
    fn test_recovery_classification() {
        assert_eq!(classify_recovery(Some("403 Forbidden"), None), RecoveryCategory::PermissionError);
        assert_eq!(classify_recovery(Some("订单不存在"), None), RecoveryCategory::DataNotFound);
        assert_eq!(classify_recovery(Some("value must be positive"), None), RecoveryCategory::ValidationError);
        assert_eq!(classify_recovery(Some("Order already exists"), None), RecoveryCategory::ResourceConflict);
        assert_eq!(classify_recovery(Some("余额不足"), None), RecoveryCategory::BusinessError);
        assert_eq!(classify_recovery(Some("connection timed out"), None), RecoveryCategory::ServiceUnavailable);
    }

    #[test]
    fn test_status_codes_need_word_boundaries() {
        assert_eq!(classify_recovery(Some("order 14035 not found"), None), RecoveryCategory::DataNotFound);
        assert_eq!(classify_recovery(Some("invoice INV-5031 missing"), None), RecoveryCategory::Unknown);
        assert_eq!(classify_recovery(Some("HTTP 401: token expired"), None), RecoveryCategory::PermissionError);
        assert_eq!(classify_recovery(Some("upstream returned (503)"), None), RecoveryCategory::ServiceUnavailable);
        assert_eq!(classify_recovery(Some("status=409"), None), RecoveryCategory::ResourceConflict);
        assert!(!contains_keyword("id 4010", "401"));
        assert!(contains_keyword("error 404.", "404"));
    }

    #[test]
    fn test_permission_never_recoverable() {
        assert!(!RecoveryCategory::PermissionError.is_recoverable());
        assert!(RecoveryCategory::ServiceUnavailable.is_recoverable());
    }

    #[test]
    fn test_every_category_has_text() {
        for category in RecoveryCategory::ALL {
            assert!(!category.description().trim().is_empty(), "{}", category);
            assert!(!category.hint().trim().is_empty(), "{}", category);
        }
    }

    #[test]
    fn test_category_parse() {
        for category in ErrorCategory::ALL {
            assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(ErrorCategory::parse("format_error"), Some(ErrorCategory::FormatError));
        assert_eq!(ErrorCategory::parse("nope"), None);
    }
}

//! Listing queries and responses for export jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::pagination::PageInfo;
use std::str::FromStr;
use uuid::Uuid;

use super::export_job::{ExportJob, ExportJobStatus};
use super::tool::{ToolDefinition, ToolType};

/// Sortable columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSortField {
    #[default]
    CreatedAt,
    CompletedAt,
    DownloadCount,
    PackageSizeBytes,
}

impl JobSortField {
    /// Column name; safe to splice into SQL.
    pub fn column(&self) -> &'static str {
        match self {
            JobSortField::CreatedAt => "created_at",
            JobSortField::CompletedAt => "completed_at",
            JobSortField::DownloadCount => "download_count",
            JobSortField::PackageSizeBytes => "package_size_bytes",
        }
    }
}

impl FromStr for JobSortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created_at" | "createdat" => Ok(JobSortField::CreatedAt),
            "completed_at" | "completedat" => Ok(JobSortField::CompletedAt),
            "download_count" | "downloadcount" => Ok(JobSortField::DownloadCount),
            "package_size_bytes" | "packagesizebytes" => Ok(JobSortField::PackageSizeBytes),
            _ => Err(format!("Unknown sort field: {}", s)),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("Unknown sort order: {}", s)),
        }
    }
}

/// Caller-facing list options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort_by: JobSortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Comma-separated statuses, e.g. `"completed,failed"`.
    pub status_filter: Option<String>,
    pub tool_type_filter: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

impl ListJobsQuery {
    /// Parse the comma-separated status filter. Empty entries are ignored.
    pub fn statuses(&self) -> Result<Vec<ExportJobStatus>, String> {
        let Some(raw) = self.status_filter.as_deref() else {
            return Ok(Vec::new());
        };

        let mut statuses = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status = part.parse::<ExportJobStatus>()?;
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    pub fn tool_type(&self) -> Result<Option<ToolType>, String> {
        match self.tool_type_filter.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<ToolType>().map(Some),
        }
    }
}

/// Store-level filter with every caller option already resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobListFilter {
    pub statuses: Vec<ExportJobStatus>,
    /// Restrict to these tools; `Some(vec![])` matches nothing.
    pub tool_ids: Option<Vec<Uuid>>,
    pub user_id: Option<Uuid>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub sort_by: JobSortField,
    pub sort_order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl JobListFilter {
    /// Whether a job satisfies every predicate (ignores sorting and paging).
    pub fn matches(&self, job: &ExportJob) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(tool_ids) = &self.tool_ids {
            if !tool_ids.contains(&job.tool_id) {
                return false;
            }
        }
        if self.user_id.is_some() && job.user_id != self.user_id {
            return false;
        }
        if self.created_from.map_or(false, |from| job.created_at < from) {
            return false;
        }
        if self.created_to.map_or(false, |to| job.created_at > to) {
            return false;
        }
        true
    }
}

/// Export job with denormalized tool fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobWithTool {
    #[serde(flatten)]
    pub job: ExportJob,
    pub tool_name: Option<String>,
    pub tool_type: Option<ToolType>,
    pub tool_description: Option<String>,
}

impl ExportJobWithTool {
    /// Attach tool fields; a tool missing from the registry leaves them empty.
    pub fn new(job: ExportJob, tool: Option<&ToolDefinition>) -> Self {
        Self {
            job,
            tool_name: tool.map(|t| t.name.clone()),
            tool_type: tool.map(|t| t.tool_type),
            tool_description: tool.and_then(|t| t.description.clone()),
        }
    }
}

/// Response for job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    pub jobs: Vec<ExportJobWithTool>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub page: i64,
    pub total_pages: i64,
}

impl ListJobsResponse {
    pub fn new(jobs: Vec<ExportJobWithTool>, page: PageInfo) -> Self {
        Self {
            jobs,
            total: page.total,
            limit: page.limit,
            offset: page.offset,
            page: page.page,
            total_pages: page.total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> ExportJob {
        ExportJob::new_pending(Uuid::new_v4(), Some(Uuid::new_v4()), 5, None, 7, Utc::now())
    }

    #[test]
    fn test_status_filter_parsing() {
        let query = ListJobsQuery {
            status_filter: Some("completed, FAILED,,completed".to_string()),
            ..Default::default()
        };
        assert_eq!(
            query.statuses().unwrap(),
            vec![ExportJobStatus::Completed, ExportJobStatus::Failed]
        );
    }

    #[test]
    fn test_status_filter_rejects_unknown() {
        let query = ListJobsQuery {
            status_filter: Some("completed,exploded".to_string()),
            ..Default::default()
        };
        assert!(query.statuses().is_err());
    }

    #[test]
    fn test_tool_type_filter() {
        let mut query = ListJobsQuery::default();
        assert_eq!(query.tool_type().unwrap(), None);
        query.tool_type_filter = Some("forms".to_string());
        assert_eq!(query.tool_type().unwrap(), Some(ToolType::Form));
        query.tool_type_filter = Some("gadgets".to_string());
        assert!(query.tool_type().is_err());
    }

    #[test]
    fn test_sort_field_parsing() {
        assert_eq!("download_count".parse::<JobSortField>().unwrap(), JobSortField::DownloadCount);
        assert_eq!(JobSortField::PackageSizeBytes.column(), "package_size_bytes");
        assert!("id; DROP TABLE".parse::<JobSortField>().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let job = job();
        let mut filter = JobListFilter::default();
        assert!(filter.matches(&job));

        filter.statuses = vec![ExportJobStatus::Completed];
        assert!(!filter.matches(&job));

        filter.statuses = vec![ExportJobStatus::Pending];
        filter.tool_ids = Some(vec![]);
        assert!(!filter.matches(&job));

        filter.tool_ids = Some(vec![job.tool_id]);
        filter.user_id = job.user_id;
        filter.created_from = Some(job.created_at - Duration::minutes(1));
        filter.created_to = Some(job.created_at + Duration::minutes(1));
        assert!(filter.matches(&job));

        filter.created_from = Some(job.created_at + Duration::seconds(1));
        assert!(!filter.matches(&job));
    }

    #[test]
    fn test_job_with_tool_flattens() {
        let with_tool = ExportJobWithTool::new(job(), None);
        let json = serde_json::to_value(&with_tool).unwrap();
        assert!(json.get("jobId").is_some());
        assert!(json.get("toolName").unwrap().is_null());
    }

    #[test]
    fn test_list_response_from_page() {
        let response = ListJobsResponse::new(vec![], PageInfo::new(41, 20, 20));
        assert_eq!(response.page, 2);
        assert_eq!(response.total_pages, 3);
        assert_eq!(response.total, 41);
    }
}

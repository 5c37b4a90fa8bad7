use chrono::Utc;
use comfy_table::{Cell, Table};
use ebroker_core::{NodeResult, Request};

pub fn render_requests(requests: &[Request]) -> String {
    if requests.is_empty() {
        return "No requests found.".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Kind", "Status", "Succeeded", "Executing", "Failed", "Template", "Created At", "Deadline"]);
    let now = Utc::now();
    for request in requests {
        table.add_row(vec![
            Cell::new(&request.request_id),
            Cell::new(format!("{:?}", request.kind).to_lowercase()),
            Cell::new(request.status()),
            Cell::new(request.count(NodeResult::Succeeded)),
            Cell::new(request.count(NodeResult::Executing)),
            Cell::new(request.count(NodeResult::Failed)),
            Cell::new(request.template_id.as_deref().unwrap_or("-")),
            Cell::new(request.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
            Cell::new(format_deadline(request, now)),
        ]);
    }
    table.to_string()
}

/// "12m" left, "Expired", or "-" once the request is done.
fn format_deadline(request: &Request, now: chrono::DateTime<Utc>) -> String {
    if request.is_terminal() {
        return "-".to_string();
    }
    if now >= request.valid_until {
        return "Expired".to_string();
    }
    let remaining = (request.valid_until - now).num_seconds();
    format!("{}m {}s", remaining / 60, remaining % 60)
}

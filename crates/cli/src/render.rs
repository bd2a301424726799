//! Plain-text rendering of job state for the terminal.

use std::collections::HashMap;

use scanwatch_core::{Job, JobId, JobStatus};

/// Renders only what changed since the previous call.
#[derive(Debug, Default)]
pub struct JobPrinter {
    status: Option<JobStatus>,
    progress: Option<u8>,
    printed_lines: usize,
}

impl JobPrinter {
    pub fn render(&mut self, job: &Job) -> Vec<String> {
        let mut out = Vec::new();

        if self.status != Some(job.status) || self.progress != Some(job.progress) {
            out.push(format!("[{}] {} {:>3}%", job.id, job.status, job.progress));
            self.status = Some(job.status);
            self.progress = Some(job.progress);
        }

        for line in job.output_log.iter().skip(self.printed_lines) {
            out.push(format!("  | {line}"));
        }
        self.printed_lines = self.printed_lines.max(job.output_log.len());

        out
    }
}

/// One row per job, sorted by id.
pub fn render_list(jobs: &HashMap<JobId, Job>) -> Vec<String> {
    let mut ids: Vec<&JobId> = jobs.keys().collect();
    ids.sort();
    ids.into_iter()
        .filter_map(|id| jobs.get(id))
        .map(|job| {
            format!(
                "{:<16} {:<10} {:>3}%  {}",
                job.id,
                job.status.as_str(),
                job.progress,
                job.name.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_header_then_only_new_lines() {
        let mut printer = JobPrinter::default();
        let mut job = Job::new("s-1");
        job.status = JobStatus::Running;
        job.progress = 10;
        job.output_log = vec!["a".into()];

        assert_eq!(printer.render(&job), vec!["[s-1] running  10%", "  | a"]);

        job.output_log.push("b".into());
        assert_eq!(printer.render(&job), vec!["  | b"]);
        assert!(printer.render(&job).is_empty());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let mut jobs = HashMap::new();
        for id in ["b", "a"] {
            jobs.insert(id.to_string(), Job::new(id));
        }
        let rows = render_list(&jobs);
        assert!(rows[0].starts_with("a "));
        assert!(rows[1].starts_with("b "));
    }
}

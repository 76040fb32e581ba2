//! `how: polarion` — xUnit document with Polarion properties.
//!
//! The document is always written to the phase directory; with `upload: true`
//! it is also posted to `<url>/polarion/import/xunit` using basic auth.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::error::specification;
use crate::io::http::HttpClient;
use crate::steps::PluginData;
use crate::steps::report::junit::{Property, XunitDocument};
use crate::steps::report::{ReportContext, ReportPlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "file": {"type": "string"},
    "upload": {"type": "boolean"},
    "url": {"type": "string"},
    "username": {"type": "string"},
    "password": {"type": "string"},
    "project-id": {"type": "string"},
    "title": {"type": "string"},
    "planned-in": {"type": "string"},
    "assignee": {"type": "string"}"#
);

pub const IMPORT_PATH: &str = "/polarion/import/xunit";

#[derive(Debug, Clone)]
pub struct PolarionReport {
    file: Option<String>,
    upload: bool,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    project_id: String,
    title: Option<String>,
    planned_in: Option<String>,
    assignee: Option<String>,
}

impl PolarionReport {
    pub fn create(data: &PluginData) -> Result<Box<dyn ReportPlugin>> {
        let project_id = data
            .get_str("project-id")
            .ok_or_else(|| specification(format!("polarion phase '{}' needs a 'project-id'", data.name)))?;
        Ok(Box::new(Self {
            file: data.get_str("file"),
            upload: data.get_bool("upload"),
            url: data.get_str("url"),
            username: data.get_str("username"),
            password: data.get_str("password"),
            project_id,
            title: data.get_str("title"),
            planned_in: data.get_str("planned-in"),
            assignee: data.get_str("assignee"),
        }))
    }

    fn document(&self, plan_name: &str) -> XunitDocument {
        let title = self
            .title
            .clone()
            .unwrap_or_else(|| plan_name.trim_start_matches('/').replace('/', "-"));
        let mut doc = XunitDocument::new(plan_name)
            .with_property("polarion-project-id", self.project_id.as_str())
            .with_property("polarion-testrun-title", title)
            .with_property("polarion-lookup-method", "custom");
        if let Some(planned_in) = &self.planned_in {
            doc = doc.with_property("polarion-custom-plannedin", planned_in.as_str());
        }
        if let Some(assignee) = &self.assignee {
            doc = doc.with_property("polarion-custom-assignee", assignee.as_str());
        }
        if let Some(user) = &self.username {
            doc = doc.with_property("polarion-user-id", user.as_str());
        }
        doc
    }

    #[instrument(skip_all, fields(project = %self.project_id))]
    fn upload(&self, ctx: &ReportContext<'_>, xml: String) -> Result<()> {
        let (Some(url), Some(username), Some(password)) = (&self.url, &self.username, &self.password) else {
            return Err(specification(
                "polarion upload needs 'url', 'username' and 'password'",
            ));
        };
        let endpoint = format!("{}{IMPORT_PATH}", url.trim_end_matches('/'));
        let response = HttpClient::new(&ctx.plan.config.http)
            .with_basic_auth(username, password)
            .post_bytes(&endpoint, "application/xml", xml.into_bytes())?
            .error_for_status("polarion import")?;
        info!(status = response.status, "results uploaded to polarion");
        ctx.plan.printer.info("uploaded", &endpoint, 2);
        Ok(())
    }
}

impl ReportPlugin for PolarionReport {
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()> {
        let xml = self.document(&ctx.plan.plan_name).render(ctx.results, ctx.execute_workdir, |result| {
            result
                .ids
                .get("id")
                .map(|id| vec![Property::new("polarion-testcase-id", id.as_str())])
                .unwrap_or_default()
        })?;
        let path = ctx.output_path(self.file.as_deref(), "xunit.xml");
        fs::write(&path, &xml).with_context(|| format!("write {}", path.display()))?;
        ctx.plan.printer.info("output", &path.display().to_string(), 2);
        if self.upload {
            self.upload(ctx, xml)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::{Outcome, TestResult};
    use std::path::Path;

    #[test]
    fn project_id_is_required() {
        assert!(PolarionReport::create(&PluginData::new("default-0", "polarion")).is_err());
    }

    #[test]
    fn document_carries_polarion_properties() {
        let report = PolarionReport {
            file: None,
            upload: false,
            url: None,
            username: Some("jdoe".to_string()),
            password: None,
            project_id: "RHEL".to_string(),
            title: None,
            planned_in: Some("RHEL-9.4".to_string()),
            assignee: None,
        };
        let mut result = TestResult::new("/t1", Outcome::Pass);
        result.ids.insert("id".to_string(), "abc-123".to_string());
        let xml = report
            .document("/plans/smoke")
            .render(&[result], Path::new("/w"), |r| {
                r.ids
                    .get("id")
                    .map(|id| vec![Property::new("polarion-testcase-id", id.as_str())])
                    .unwrap_or_default()
            })
            .expect("render");
        assert!(xml.contains(r#"name="polarion-testrun-title" value="plans-smoke""#));
        assert!(xml.contains(r#"name="polarion-custom-plannedin" value="RHEL-9.4""#));
        assert!(xml.contains(r#"name="polarion-user-id" value="jdoe""#));
        assert!(xml.contains(r#"name="polarion-testcase-id" value="abc-123""#));
    }
}

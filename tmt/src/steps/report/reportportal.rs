//! `how: reportportal` — import results into ReportPortal.
//!
//! The xUnit document is zipped as `<launch>.zip` and uploaded as a
//! multipart file to `POST <url>/api/v1/<project>/launch/import` with a
//! bearer token. `url` and `token` fall back to
//! `TMT_REPORT_REPORTPORTAL_URL` and `TMT_REPORT_REPORTPORTAL_TOKEN`.

use std::fs;
use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use tracing::{info, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::specification;
use crate::io::http::{HttpClient, multipart_file};
use crate::steps::PluginData;
use crate::steps::report::junit::XunitDocument;
use crate::steps::report::{ReportContext, ReportPlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "url": {"type": "string"},
    "token": {"type": "string"},
    "project": {"type": "string"},
    "launch": {"type": "string"}"#
);

pub const URL_ENV: &str = "TMT_REPORT_REPORTPORTAL_URL";
pub const TOKEN_ENV: &str = "TMT_REPORT_REPORTPORTAL_TOKEN";

#[derive(Debug, Clone)]
pub struct ReportPortalReport {
    url: Option<String>,
    token: Option<String>,
    project: Option<String>,
    launch: Option<String>,
}

/// Connection settings after applying environment fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    url: String,
    token: String,
    project: String,
}

impl ReportPortalReport {
    pub fn create(data: &PluginData) -> Result<Box<dyn ReportPlugin>> {
        Ok(Box::new(Self {
            url: data.get_str("url"),
            token: data.get_str("token"),
            project: data.get_str("project"),
            launch: data.get_str("launch"),
        }))
    }

    fn endpoint(&self, env_url: Option<String>, env_token: Option<String>) -> Result<Endpoint> {
        let url = self
            .url
            .clone()
            .or(env_url)
            .ok_or_else(|| specification(format!("reportportal needs 'url' or {URL_ENV}")))?;
        let token = self
            .token
            .clone()
            .or(env_token)
            .ok_or_else(|| specification(format!("reportportal needs 'token' or {TOKEN_ENV}")))?;
        let project = self
            .project
            .clone()
            .ok_or_else(|| specification("reportportal needs a 'project'"))?;
        Ok(Endpoint { url, token, project })
    }

    fn launch_name(&self, plan_name: &str) -> String {
        self.launch
            .clone()
            .unwrap_or_else(|| plan_name.trim_start_matches('/').replace('/', "-"))
    }
}

/// A zip archive holding a single `name` entry.
pub fn zip_single(name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(name, options).with_context(|| format!("add {name} to archive"))?;
        zip.write_all(contents).with_context(|| format!("write {name} to archive"))?;
        zip.finish().context("finish archive")?;
    }
    Ok(buffer.into_inner())
}

impl ReportPlugin for ReportPortalReport {
    #[instrument(skip_all, fields(plan = %ctx.plan.plan_name))]
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()> {
        let endpoint = self.endpoint(std::env::var(URL_ENV).ok(), std::env::var(TOKEN_ENV).ok())?;
        let launch = self.launch_name(&ctx.plan.plan_name);
        let xml = XunitDocument::new(launch.as_str()).render(ctx.results, ctx.execute_workdir, |_| Vec::new())?;
        let archive = zip_single(&format!("{launch}.xml"), xml.as_bytes())?;
        let archive_path = ctx.phase_dir.join(format!("{launch}.zip"));
        fs::write(&archive_path, &archive).with_context(|| format!("write {}", archive_path.display()))?;

        let (content_type, body) = multipart_file("file", &format!("{launch}.zip"), "application/zip", &archive);
        let url = format!(
            "{}/api/v1/{}/launch/import",
            endpoint.url.trim_end_matches('/'),
            endpoint.project
        );
        let response = HttpClient::new(&ctx.plan.config.http)
            .with_bearer(&endpoint.token)
            .post_bytes(&url, &content_type, body)?
            .error_for_status("reportportal import")?;
        info!(status = response.status, launch = %launch, "launch imported");
        ctx.plan.printer.info("launch", &launch, 2);
        Ok(())
    }
}

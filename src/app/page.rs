use anyhow::Context;
use handlebars::Handlebars;
use serde::Serialize;

const TEMPLATE_NAME: &str = "page";

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>{{title}}</title>
{{{head}}}
</head>
<body>
{{{body}}}
</body>
</html>
<!-- load log
{{#each log}}
  {{this}}
{{/each}}
-->
"#;

/// Everything a page template can refer to.
#[derive(Debug, Serialize)]
pub struct PageReport {
    pub title: String,
    pub head: String,
    pub body: String,
    pub log: Vec<String>,
}

/// Render with `template`, or the built-in one if none is given.
pub fn render(report: &PageReport, template: Option<&str>) -> anyhow::Result<String> {
    let mut hb = Handlebars::new();

    hb.register_template_string(TEMPLATE_NAME, template.unwrap_or(DEFAULT_TEMPLATE))
        .context("Failed to register page template!")?;

    hb.render(TEMPLATE_NAME, report)
        .context("Failed to render page!")
}

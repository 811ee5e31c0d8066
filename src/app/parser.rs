use std::collections::{BTreeMap, BTreeSet};

use scraper::{ElementRef, Html, Selector};

use super::urls::{job_id_from_url, resolve_href, title_from_slug};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlFields {
    pub page_url: String,
    pub job_id: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub posted_date: Option<String>,
    pub description_html: Option<String>,
    pub apply_url: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

pub trait JobPageParser: Send + Sync {
    fn detail_links(&self, page_url: &str, html: &str) -> Vec<String>;

    fn parse_detail(&self, page_url: &str, html: &str) -> Result<HtmlFields, String>;
}

const DETAIL_LINK: &str = "a[href*='JobDetail']";
const TITLE_VALUE: &str = "article.article--details .article__content__view__field__value";
const FIELD: &str = "article .article__content__view__field";
const FIELD_LABEL: &str = ".article__content__view__field__label";
const FIELD_VALUE: &str = ".article__content__view__field__value";
const RICH_TEXT: &str = ".field--rich-text .article__content__view__field__value";
const RICH_TEXT_LOOSE: &str = "div[class*='field--rich-text']";
const APPLY_BUTTON: &str = "a.button--primary[href*='Login?jobId=']";

const LOCATION_LABELS: [&str; 3] = ["Location", "Locations", "City"];
const POSTED_LABELS: [&str; 3] = ["Posted Date", "Date Posted", "Posting Date"];
const REF_LABELS: [&str; 4] = ["Ref #", "Ref#", "Requisition", "Req #"];

#[derive(Debug, Default, Clone, Copy)]
pub struct AvatureHtmlParser;

impl JobPageParser for AvatureHtmlParser {
    fn detail_links(&self, page_url: &str, html: &str) -> Vec<String> {
        let Ok(selector) = Selector::parse(DETAIL_LINK) else {
            return Vec::new();
        };
        let doc = Html::parse_document(html);
        doc.select(&selector)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| resolve_href(page_url, href))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn parse_detail(&self, page_url: &str, html: &str) -> Result<HtmlFields, String> {
        let doc = Html::parse_document(html);

        let mut metadata = BTreeMap::new();
        if let (Ok(field), Ok(label_sel), Ok(value_sel)) = (
            Selector::parse(FIELD),
            Selector::parse(FIELD_LABEL),
            Selector::parse(FIELD_VALUE),
        ) {
            for el in doc.select(&field) {
                let label = first_text_in(el, &label_sel);
                let value = first_text_in(el, &value_sel);
                let label = label.trim_end_matches(':').trim();
                if !label.is_empty() && !value.is_empty() {
                    metadata.insert(label.to_string(), value);
                }
            }
        }
        let lookup = |labels: &[&str]| -> Option<String> {
            labels.iter().find_map(|label| metadata.get(*label).cloned())
        };

        let title = Some(extract_first_text(&doc, TITLE_VALUE))
            .filter(|t| !t.is_empty())
            .or_else(|| title_from_slug(page_url));
        let Some(title) = title else {
            return Err("no title field and no slug".to_string());
        };

        let job_id = job_id_from_url(page_url).or_else(|| lookup(&REF_LABELS[..]));
        let description_html =
            extract_first_html(&doc, RICH_TEXT).or_else(|| extract_first_html(&doc, RICH_TEXT_LOOSE));
        let apply_url = Selector::parse(APPLY_BUTTON).ok().and_then(|sel| {
            doc.select(&sel)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|href| resolve_href(page_url, href))
        });

        Ok(HtmlFields {
            page_url: page_url.to_string(),
            job_id,
            title: Some(title),
            location: lookup(&LOCATION_LABELS[..]),
            posted_date: lookup(&POSTED_LABELS[..]),
            description_html,
            apply_url,
            metadata,
        })
    }
}

fn extract_first_text(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    for el in doc.select(&selector) {
        let text = normalize_text(&el.text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() {
            return text;
        }
    }

    String::new()
}

fn first_text_in(el: ElementRef<'_>, selector: &Selector) -> String {
    el.select(selector)
        .next()
        .map(|v| normalize_text(&v.text().collect::<Vec<_>>().join(" ")))
        .unwrap_or_default()
}

fn extract_first_html(doc: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector)
        .map(|el| el.inner_html().trim().to_string())
        .find(|html| !html.is_empty())
}

pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn html_to_text(fragment: &str) -> String {
    let doc = Html::parse_fragment(fragment);
    normalize_text(&doc.root_element().text().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
<html><body>
<header><h1>Acme Careers</h1></header>
<article class="article article--details">
  <div class="article__content__view__field">
    <div class="article__content__view__field__value"> Software   Engineer </div>
  </div>
  <div class="article__content__view__field">
    <div class="article__content__view__field__label">Location:</div>
    <div class="article__content__view__field__value">Berlin, DE</div>
  </div>
  <div class="article__content__view__field">
    <div class="article__content__view__field__label">Ref #</div>
    <div class="article__content__view__field__value">R-2031</div>
  </div>
  <div class="article__content__view__field field--rich-text">
    <div class="article__content__view__field__value"><p>Build <b>things</b>.</p></div>
  </div>
</article>
<a class="button button--primary" href="/careers/Login?jobId=4521">Apply now</a>
</body></html>"#;

    #[test]
    fn parses_stock_detail_page() {
        let url = "https://acme.avature.net/careers/JobDetail/Software-Engineer/4521";
        let fields = AvatureHtmlParser.parse_detail(url, DETAIL).unwrap();
        assert_eq!(fields.title.as_deref(), Some("Software Engineer"));
        assert_eq!(fields.job_id.as_deref(), Some("4521"));
        assert_eq!(fields.location.as_deref(), Some("Berlin, DE"));
        assert_eq!(fields.metadata.get("Ref #").map(String::as_str), Some("R-2031"));
        assert_eq!(
            fields.apply_url.as_deref(),
            Some("https://acme.avature.net/careers/Login?jobId=4521")
        );
        assert_eq!(
            fields.description_html.as_deref().map(html_to_text).as_deref(),
            Some("Build things .")
        );
    }

    #[test]
    fn falls_back_to_slug_and_fails_without_either() {
        let fields = AvatureHtmlParser
            .parse_detail(
                "https://acme.avature.net/careers/JobDetail/Data-Analyst/77",
                "<html><body><p>moved</p></body></html>",
            )
            .unwrap();
        assert_eq!(fields.title.as_deref(), Some("Data Analyst"));
        assert_eq!(fields.location, None);

        assert!(
            AvatureHtmlParser
                .parse_detail("https://acme.avature.net/careers/JobDetail/77", "<html></html>")
                .is_err()
        );
    }

    #[test]
    fn listing_links_are_absolute_and_unique() {
        let html = r##"
<ul>
  <li><a href="/careers/JobDetail/Software-Engineer/4521">Software Engineer</a></li>
  <li><a href="https://acme.avature.net/careers/JobDetail/Software-Engineer/4521#apply">again</a></li>
  <li><a href="JobDetail/Analyst/12">Analyst</a></li>
  <li><a href="/careers/SearchJobs?jobOffset=25">next</a></li>
</ul>"##;
        let links = AvatureHtmlParser.detail_links("https://acme.avature.net/careers/SearchJobs/", html);
        assert_eq!(
            links,
            vec![
                "https://acme.avature.net/careers/JobDetail/Software-Engineer/4521".to_string(),
                "https://acme.avature.net/careers/SearchJobs/JobDetail/Analyst/12".to_string(),
            ]
        );
    }
}

//! Checkbox crawling
//!
//! The portal renders every requestable file as a checkbox followed by its
//! label. Crawling the page source yields label -> checkbox id pairs.

use crate::logging::Logger;
use scraper::{ElementRef, Html};
use std::collections::BTreeMap;

pub struct CheckboxCrawler {
    logger: Logger,
}

impl CheckboxCrawler {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    /// Label -> checkbox id for every checkbox carrying an id.
    ///
    /// The label is the text of the element following the checkbox in
    /// document order. Later duplicates of a label win.
    pub fn checkboxes(&self, html: &str) -> BTreeMap<String, String> {
        let document = Html::parse_document(html);
        let elements: Vec<ElementRef> = document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .collect();

        let mut found = BTreeMap::new();
        for (index, element) in elements.iter().enumerate() {
            let value = element.value();
            let is_checkbox = value.name() == "input"
                && value
                    .attr("type")
                    .is_some_and(|t| t.eq_ignore_ascii_case("checkbox"));
            if !is_checkbox {
                continue;
            }
            let Some(id) = value.attr("id") else {
                continue;
            };
            let Some(next) = elements.get(index + 1) else {
                continue;
            };

            let label: String = next.text().collect();
            let label = label.trim();
            if label.is_empty() {
                self.logger
                    .warn(format_args!("Found checkbox with no name: {}", id));
                continue;
            }
            found.insert(label.to_string(), id.to_string());
        }

        if found.is_empty() {
            self.logger.warn("No checkbox found on the page");
        } else {
            self.logger
                .info(format_args!("Found {} labelled checkbox(es)", found.len()));
        }
        found
    }

    /// Guessed file name -> checkbox id for the study-data page.
    ///
    /// Only numeric ids name downloadable files, and archived tables are
    /// skipped.
    pub fn study_data(&self, html: &str) -> BTreeMap<String, String> {
        study_data_catalog(self.checkboxes(html))
    }
}

pub fn study_data_catalog(checkboxes: BTreeMap<String, String>) -> BTreeMap<String, String> {
    checkboxes
        .into_iter()
        .filter(|(label, id)| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !label.contains("Archived")
        })
        .map(|(label, id)| (clean_name(&label), id))
        .collect()
}

/// Turn a checkbox label into the file name the portal is guessed to use:
/// ASCII whitespace and punctuation other than `-` become `_`, plus `.csv`.
pub fn clean_name(label: &str) -> String {
    let mut name: String = label
        .chars()
        .map(|c| {
            let replace = c.is_ascii_whitespace()
                || c == '\x0b'
                || (c.is_ascii_punctuation() && c != '-');
            if replace {
                '_'
            } else {
                c
            }
        })
        .collect();
    name.push_str(".csv");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
        <html><body>
          <table>
            <tr><td><input type="checkbox" id="1001"></td><td><a href="#">Demographics</a></td></tr>
            <tr><td><input type="checkbox" id="1002"></td><td><span>Vital Signs (Archived)</span></td></tr>
            <tr><td><input type="checkbox" id="toggleAll"></td><td><b>Select all</b></td></tr>
            <tr><td><input type="checkbox" id="1003"></td><td><a>  Primary Clinical Diagnosis  </a></td></tr>
            <tr><td><input type="checkbox" id="1004"></td><td><a> </a></td></tr>
            <tr><td><input type="checkbox"></td><td><a>No id</a></td></tr>
          </table>
        </body></html>
    "##;

    #[test]
    fn test_crawl_labels() {
        let crawler = CheckboxCrawler::new(Logger::silent());
        let found = crawler.checkboxes(PAGE);

        assert_eq!(found.get("Demographics").map(String::as_str), Some("1001"));
        assert_eq!(
            found.get("Primary Clinical Diagnosis").map(String::as_str),
            Some("1003")
        );
        assert_eq!(found.get("Select all").map(String::as_str), Some("toggleAll"));
        assert!(!found.values().any(|id| id == "1004"));
        assert!(!found.contains_key("No id"));
    }

    #[test]
    fn test_study_data_filter() {
        let crawler = CheckboxCrawler::new(Logger::silent());
        let catalog = crawler.study_data(PAGE);

        assert_eq!(
            catalog,
            BTreeMap::from([
                ("Demographics.csv".to_string(), "1001".to_string()),
                ("Primary_Clinical_Diagnosis.csv".to_string(), "1003".to_string()),
            ])
        );
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Vital Signs"), "Vital_Signs.csv");
        assert_eq!(clean_name("MDS-UPDRS Part I (Patient)"), "MDS-UPDRS_Part_I__Patient_.csv");
        assert_eq!(clean_name("Ä/B"), "Ä_B.csv");
    }
}

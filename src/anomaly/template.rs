//! Log template extraction.
//!
//! Variable parts of a message (IPs, URLs, quoted strings, numbers) are masked
//! so lines produced by the same log statement share one template. Templates
//! are interned to dense [`TemplateId`]s in order of first appearance. Once the
//! catalogue is full, new templates all map to [`TemplateId::OVERFLOW`] so ids
//! already known to a trained scorer stay stable.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u32);

impl TemplateId {
    /// Shared by every template seen after the catalogue is full
    pub const OVERFLOW: TemplateId = TemplateId(u32::MAX);
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

pub trait TemplateExtractor: Send + Sync + fmt::Debug {
    /// Template id and masked template text for a log message
    fn extract(&self, message: &str) -> (TemplateId, String);

    fn template(&self, id: TemplateId) -> Option<String>;

    fn template_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct Interner {
    ids: HashMap<String, TemplateId>,
    templates: Vec<String>,
    /// Messages mapped to the overflow id
    overflowed: u64,
}

#[derive(Debug)]
pub struct MaskingTemplateExtractor {
    ip: Regex,
    url: Regex,
    double_quoted: Regex,
    single_quoted: Regex,
    number: Regex,
    max_templates: usize,
    interner: RwLock<Interner>,
}

impl MaskingTemplateExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_max_templates(constants::DEFAULT_MAX_TEMPLATES)
    }

    pub fn with_max_templates(max_templates: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            ip: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b")?,
            url: Regex::new(r"https?://\S+")?,
            double_quoted: Regex::new(r#""[^"]*""#)?,
            single_quoted: Regex::new(r"'[^']*'")?,
            number: Regex::new(r"\b\d+(?:\.\d+)?\b")?,
            max_templates,
            interner: RwLock::new(Interner::default()),
        })
    }

    /// Masked form of `message` without interning it
    pub fn mask(&self, message: &str) -> String {
        let masked = self.url.replace_all(message.trim(), "<URL>");
        let masked = self.ip.replace_all(&masked, "<IP>");
        let masked = self.double_quoted.replace_all(&masked, "<STR>");
        let masked = self.single_quoted.replace_all(&masked, "<STR>");
        self.number.replace_all(&masked, "<NUM>").into_owned()
    }

    fn intern(&self, template: String) -> TemplateId {
        if let Some(id) = self.interner.read().ids.get(&template) {
            return *id;
        }

        let mut interner = self.interner.write();
        if let Some(id) = interner.ids.get(&template) {
            return *id;
        }
        if interner.templates.len() >= self.max_templates {
            interner.overflowed += 1;
            if interner.overflowed == 1 {
                warn!(
                    max_templates = self.max_templates,
                    "Template catalogue full, new templates share the overflow id"
                );
            }
            return TemplateId::OVERFLOW;
        }
        let id = TemplateId(interner.templates.len() as u32);
        interner.templates.push(template.clone());
        interner.ids.insert(template, id);
        id
    }
}

impl TemplateExtractor for MaskingTemplateExtractor {
    fn extract(&self, message: &str) -> (TemplateId, String) {
        let template = self.mask(message);
        let id = self.intern(template.clone());
        (id, template)
    }

    fn template(&self, id: TemplateId) -> Option<String> {
        self.interner.read().templates.get(id.0 as usize).cloned()
    }

    fn template_count(&self) -> usize {
        self.interner.read().templates.len()
    }
}

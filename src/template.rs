//! Certificate templates and their content-addressed registry
use super::error::{TemplateError, WorkflowError};
use super::render::RendererError;
use super::types::ArtifactRef;
use super::utils::{content_hash, from_cbor, to_cbor};
use std::collections::{BTreeMap, BTreeSet};

pub const MAX_LOGOS: usize = 3;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogoSlot {
    #[n(0)]
    TopLeft,
    #[n(1)]
    TopCenter,
    #[n(2)]
    TopRight,
}

impl LogoSlot {
    /// (x, y, width, height) in millimetres on a 297x210 landscape page
    pub fn frame(&self) -> (f32, f32, f32, f32) {
        match self {
            LogoSlot::TopLeft => (49.5, 20.0, 37.0, 30.0),
            LogoSlot::TopCenter => ((297.0 - 40.0) / 2.0, 20.0, 40.0, 30.0),
            LogoSlot::TopRight => (217.5, 20.0, 35.0, 28.0),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Logo {
    #[n(0)]
    pub slot: LogoSlot,
    #[n(1)]
    pub asset: ArtifactRef,
}

// Key is the hash of this struct encoded into CBOR, so a registered template never changes
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct Template {
    // No ID field, as the ID *is* the hash of this struct
    #[n(0)]
    title: String,
    #[n(1)]
    body: String, // text with `{Field}` placeholders
    #[n(2)]
    background: Option<ArtifactRef>,
    #[n(3)]
    logos: Vec<Logo>,
    #[n(4)]
    field_schema: Vec<String>,
    #[n(5)]
    owner: Option<String>,
}

impl Template {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
    pub fn set_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }
    pub fn set_background(mut self, asset: ArtifactRef) -> Self {
        self.background = Some(asset);
        self
    }
    pub fn add_logo(mut self, slot: LogoSlot, asset: ArtifactRef) -> Self {
        self.logos.push(Logo { slot, asset });
        self
    }
    pub fn require_field(mut self, name: &str) -> Self {
        self.field_schema.push(name.to_string());
        self
    }
    pub fn set_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn background(&self) -> Option<&ArtifactRef> {
        self.background.as_ref()
    }
    pub fn logos(&self) -> &[Logo] {
        &self.logos
    }
    pub fn field_schema(&self) -> &[String] {
        &self.field_schema
    }
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Every asset the template points at, background first.
    pub fn asset_refs(&self) -> Vec<&ArtifactRef> {
        self.background
            .iter()
            .chain(self.logos.iter().map(|logo| &logo.asset))
            .collect()
    }

    // Field names referenced by `{...}` in the body, in order of appearance
    fn placeholders(&self) -> Result<Vec<&str>, TemplateError> {
        let mut found = vec![];
        let mut rest = self.body.as_str();
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or(TemplateError::UnterminatedPlaceholder)?;
            found.push(&after[..end]);
            rest = &after[end + 1..];
        }
        Ok(found)
    }

    /// Check that a subject row supplies a non-empty value for every declared field.
    /// Returns the first missing field name.
    pub fn missing_field(&self, fields: &BTreeMap<String, String>) -> Option<&str> {
        self.field_schema
            .iter()
            .find(|name| fields.get(*name).is_none_or(|v| v.trim().is_empty()))
            .map(String::as_str)
    }

    /// Substitute the body's placeholders with the row's values in one pass.
    /// Values are copied verbatim, braces inside them are never expanded.
    pub fn fill(&self, fields: &BTreeMap<String, String>) -> Result<String, RendererError> {
        let mut out = String::with_capacity(self.body.len());
        let mut rest = self.body.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('}').ok_or_else(|| {
                RendererError::Failed(TemplateError::UnterminatedPlaceholder.to_string())
            })?;
            let name = &after[..end];
            let value = fields
                .get(name)
                .ok_or_else(|| RendererError::MissingField(name.to_string()))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    // Checks fields, and performs validation. returns a hash of the template and its contents serialised into cbor
    pub fn validate_and_finalise(&self) -> Result<(String, Vec<u8>), WorkflowError> {
        if self.background.is_none() {
            return Err(TemplateError::MissingBackground.into());
        }
        if self.body.trim().is_empty() {
            return Err(TemplateError::MissingBody.into());
        }
        if self.field_schema.is_empty() {
            return Err(TemplateError::EmptySchema.into());
        }

        let mut declared = BTreeSet::new();
        for field in &self.field_schema {
            if !declared.insert(field.as_str()) {
                return Err(TemplateError::DuplicateField(field.clone()).into());
            }
        }

        if self.logos.len() > MAX_LOGOS {
            return Err(TemplateError::TooManyLogos(self.logos.len()).into());
        }
        let mut slots = BTreeSet::new();
        for logo in &self.logos {
            if !slots.insert(logo.slot) {
                return Err(TemplateError::DuplicateLogoSlot(logo.slot).into());
            }
        }

        for name in self.placeholders()? {
            if !declared.contains(name) {
                return Err(TemplateError::UndeclaredPlaceholder(name.to_string()).into());
            }
        }

        let contents = to_cbor(self)?;
        let hash = content_hash(&contents);

        Ok((hash, contents))
    }
}

/// Templates keyed by the hash of their encoding.
#[derive(Clone)]
pub struct TemplateStore {
    templates: sled::Tree,
}

impl TemplateStore {
    pub fn open(db: &sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            templates: db.open_tree("templates")?,
        })
    }

    /// Validate and store a template, returning its id. Registering the same template twice is a no-op.
    pub fn register(&self, template: &Template) -> Result<String, WorkflowError> {
        let (id, contents) = template.validate_and_finalise()?;
        // identical content under an identical key, a lost race changes nothing
        let _ = self
            .templates
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(contents))?;
        Ok(id)
    }

    pub fn load(&self, template_id: &str) -> Result<Template, WorkflowError> {
        let raw = self
            .templates
            .get(template_id.as_bytes())?
            .ok_or_else(|| WorkflowError::TemplateNotFound(template_id.to_string()))?;
        from_cbor(&raw)
    }
}

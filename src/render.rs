//! Document renderer boundary and the plain-text reference renderer
use super::template::Template;
use super::utils::content_hash;
use std::collections::BTreeMap;

/// Landscape page width in points, used to resolve right-anchored placements.
pub const PAGE_WIDTH: f32 = 841.89;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RendererError {
    #[error("rendering failed: {0}")]
    Failed(String),
    #[error("missing value for field '{0}'")]
    MissingField(String),
    #[error("prior document is empty")]
    EmptyDocument,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    Left,
    Right,
}

/// Where a signature image lands on the document.
#[derive(Debug, Clone, PartialEq)]
pub struct SignaturePlacement {
    pub page: u32,
    pub anchor: Anchor,
    pub offset_x: f32, // from the anchored edge
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl SignaturePlacement {
    pub fn left(offset_x: f32, y: f32) -> Self {
        Self {
            page: 0,
            anchor: Anchor::Left,
            offset_x,
            y,
            width: 120.0,
            height: 60.0,
        }
    }
    pub fn right(offset_x: f32, y: f32) -> Self {
        Self {
            anchor: Anchor::Right,
            ..Self::left(offset_x, y)
        }
    }
    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
    /// Absolute x of the image's left edge on a page `page_width` wide.
    pub fn resolve_x(&self, page_width: f32) -> f32 {
        match self.anchor {
            Anchor::Left => self.offset_x,
            Anchor::Right => page_width - self.width - self.offset_x,
        }
    }
}

/// Asset bytes resolved from the artifact store for one render call.
#[derive(Debug, Clone, Default)]
pub struct TemplateAssets {
    pub background: Vec<u8>,
    pub logos: Vec<Vec<u8>>, // same order as `Template::logos`
}

/// External collaborator that turns templates into documents and stamps signatures on them.
///
/// Implementations must be deterministic: identical inputs must produce identical bytes,
/// otherwise a retried transition would yield a different artifact.
pub trait DocumentRenderer: Send + Sync {
    fn render_document(
        &self,
        template: &Template,
        assets: &TemplateAssets,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, RendererError>;

    fn stamp_signature(
        &self,
        prior: &[u8],
        signature: &[u8],
        placement: &SignaturePlacement,
    ) -> Result<Vec<u8>, RendererError>;
}

/// Renders certificates as UTF-8 text documents. Useful for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct TextRenderer;

impl TextRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentRenderer for TextRenderer {
    fn render_document(
        &self,
        template: &Template,
        assets: &TemplateAssets,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, RendererError> {
        let mut doc = String::new();
        doc.push_str(&format!("== {} ==\n", template.title()));
        doc.push_str(&format!("background sha256={}\n", content_hash(&assets.background)));

        for (logo, bytes) in template.logos().iter().zip(assets.logos.iter()) {
            let (x, y, w, h) = logo.slot.frame();
            doc.push_str(&format!(
                "logo {:?} sha256={} at x={x:.1} y={y:.1} w={w:.1} h={h:.1}\n",
                logo.slot,
                content_hash(bytes)
            ));
        }

        doc.push_str(&template.fill(fields)?);
        doc.push('\n');

        Ok(doc.into_bytes())
    }

    fn stamp_signature(
        &self,
        prior: &[u8],
        signature: &[u8],
        placement: &SignaturePlacement,
    ) -> Result<Vec<u8>, RendererError> {
        if prior.is_empty() {
            return Err(RendererError::EmptyDocument);
        }

        let mut doc = prior.to_vec();
        let stamp = format!(
            "[signature sha256={} page={} x={:.1} y={:.1} w={:.1} h={:.1}]\n",
            content_hash(signature),
            placement.page,
            placement.resolve_x(PAGE_WIDTH),
            placement.y,
            placement.width,
            placement.height,
        );
        doc.extend_from_slice(stamp.as_bytes());

        Ok(doc)
    }
}

//! OCR page representation

use serde::{Deserialize, Serialize};

/// Reference to an image extracted by OCR.
///
/// Question nodes hold clones of these after media association; the page
/// that produced the image stays the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Image identifier as it appears in the page markdown (e.g. `img-0.jpeg`)
    pub id: String,
    /// Index of the page the image was found on
    #[serde(default)]
    pub page_index: usize,
    /// Position of the image within its page's image list
    #[serde(default)]
    pub position_in_page: usize,
    /// Image format (`jpeg`, `png`, ...)
    #[serde(default)]
    pub format: String,
    /// Opaque pointer to where the image bytes live (path, object key, ...)
    #[serde(default, alias = "image_path", skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>, page_index: usize, position_in_page: usize) -> Self {
        let id = id.into();
        let format = format_from_id(&id);
        Self {
            id,
            page_index,
            position_in_page,
            format,
            storage_ref: None,
        }
    }

    pub fn with_storage_ref(mut self, storage_ref: impl Into<String>) -> Self {
        self.storage_ref = Some(storage_ref.into());
        self
    }
}

/// Derive an image format from the extension of its id, defaulting to jpeg.
pub(crate) fn format_from_id(id: &str) -> String {
    match id.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => match ext.to_ascii_lowercase().as_str() {
            "jpg" => "jpeg".to_string(),
            other => other.to_string(),
        },
        _ => "jpeg".to_string(),
    }
}

/// One page of an OCR'd document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Page index as reported by OCR
    pub index: usize,
    /// Page content as markdown
    #[serde(default)]
    pub markdown: String,
    /// Images extracted from this page
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl Page {
    pub fn new(index: usize, markdown: impl Into<String>) -> Self {
        Self {
            index,
            markdown: markdown.into(),
            images: Vec::new(),
        }
    }

    /// Attach an image; its page index and position are filled in from this page.
    pub fn with_image(mut self, id: impl Into<String>) -> Self {
        let position = self.images.len();
        self.images.push(ImageRef::new(id, self.index, position));
        self
    }

    /// Fill in page-derived image fields that OCR output leaves out.
    pub fn normalize_images(&mut self) {
        for (position, image) in self.images.iter_mut().enumerate() {
            image.page_index = self.index;
            image.position_in_page = position;
            if image.format.is_empty() {
                image.format = format_from_id(&image.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_taken_from_extension() {
        assert_eq!(format_from_id("img-0.png"), "png");
        assert_eq!(format_from_id("img-0.JPG"), "jpeg");
        assert_eq!(format_from_id("img-0"), "jpeg");
    }

    #[test]
    fn normalize_fills_page_fields() {
        let json = r#"{"index": 3, "markdown": "![img-0.jpeg](img-0.jpeg)",
            "images": [{"id": "img-0.jpeg", "image_path": "s23/images/img_3_0.jpeg"},
                       {"id": "img-1.png"}]}"#;
        let mut page: Page = serde_json::from_str(json).unwrap();
        page.normalize_images();

        assert_eq!(page.images[0].page_index, 3);
        assert_eq!(page.images[1].position_in_page, 1);
        assert_eq!(page.images[1].format, "png");
        assert_eq!(
            page.images[0].storage_ref.as_deref(),
            Some("s23/images/img_3_0.jpeg")
        );
    }
}

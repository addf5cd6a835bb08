//! Buffered multipart forms.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::Multipart;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Text fields by name plus every part that carried a filename.
#[derive(Debug, Default)]
pub struct MultipartForm {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

impl MultipartForm {
    pub async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);

            if filename.is_some() {
                let bytes = field.bytes().await?.to_vec();
                form.files.push(UploadedFile {
                    field: name,
                    filename,
                    content_type,
                    bytes,
                });
            } else {
                let text = field.text().await?;
                form.fields.insert(name, text);
            }
        }

        Ok(form)
    }

    /// Non-blank text field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Text field parsed as `T`; a present but unparsable value is a 400.
    pub fn parsed<T: FromStr>(&self, name: &str) -> ApiResult<Option<T>> {
        match self.field(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ApiError::validation(format!("Invalid value for {}", name))),
        }
    }

    /// Remove and return every file sent under `name`, in request order.
    pub fn take_files(&mut self, name: &str) -> Vec<UploadedFile> {
        let (taken, rest) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|f| f.field == name);
        self.files = rest;
        taken
    }

    pub fn take_file(&mut self, name: &str) -> Option<UploadedFile> {
        let index = self.files.iter().position(|f| f.field == name)?;
        Some(self.files.remove(index))
    }
}

#[cfg(test)]
impl MultipartForm {
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_file(mut self, field: &str, filename: &str, bytes: Vec<u8>) -> Self {
        self.files.push(UploadedFile {
            field: field.to_string(),
            filename: Some(filename.to_string()),
            content_type: None,
            bytes,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_fields_are_absent() {
        let form = MultipartForm::default()
            .with_field("sessionId", "  ")
            .with_field("title", " Checkout ");
        assert_eq!(form.field("sessionId"), None);
        assert_eq!(form.field("title"), Some("Checkout"));
        assert_eq!(form.field("missing"), None);
    }

    #[test]
    fn test_parsed_field() {
        let form = MultipartForm::default()
            .with_field("sequenceNumber", "4")
            .with_field("stepNumber", "four");
        assert_eq!(form.parsed::<i32>("sequenceNumber").unwrap(), Some(4));
        assert_eq!(form.parsed::<i32>("missing").unwrap(), None);
        let err = form.parsed::<i32>("stepNumber").unwrap_err();
        assert_eq!(err.classify().1, "VALIDATION_ERROR");
    }

    #[test]
    fn test_take_files_keeps_order_and_others() {
        let mut form = MultipartForm::default()
            .with_file("screenshots", "a.png", vec![1])
            .with_file("other", "x.png", vec![9])
            .with_file("screenshots", "b.png", vec![2]);

        let taken = form.take_files("screenshots");
        let names: Vec<_> = taken.iter().filter_map(|f| f.filename.as_deref()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert!(form.take_file("screenshots").is_none());
        assert_eq!(form.take_file("other").unwrap().bytes, vec![9]);
    }
}

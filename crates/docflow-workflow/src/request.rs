use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Wire names of the fields every start request must carry.
pub const REQUIRED_FIELDS: [&str; 5] = [
  "documentId",
  "fileInfoId",
  "documentType",
  "bucket_name",
  "file_name",
];

/// The payload that initiates an execution.
///
/// Immutable once the execution has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
  #[serde(rename = "documentId")]
  pub document_id: String,
  #[serde(rename = "fileInfoId")]
  pub file_info_id: String,
  #[serde(rename = "documentType")]
  pub document_type: String,
  pub bucket_name: String,
  pub file_name: String,
}

impl WorkflowRequest {
  /// Validate and parse a raw start request.
  ///
  /// Every field in [`REQUIRED_FIELDS`] must be a non-blank string. All
  /// missing fields are reported at once, in declaration order.
  pub fn from_json(value: &serde_json::Value) -> Result<Self, RequestError> {
    let object = value.as_object().ok_or(RequestError::NotAnObject)?;

    let missing: Vec<String> = REQUIRED_FIELDS
      .iter()
      .filter(|field| {
        !object
          .get(**field)
          .and_then(|v| v.as_str())
          .is_some_and(|s| !s.trim().is_empty())
      })
      .map(|field| field.to_string())
      .collect();

    if !missing.is_empty() {
      return Err(RequestError::MissingFields { fields: missing });
    }

    serde_json::from_value(value.clone()).map_err(|e| RequestError::Malformed {
      message: e.to_string(),
    })
  }

  /// The document reference carried by this request.
  pub fn document(&self) -> DocumentRef {
    DocumentRef {
      document_id: self.document_id.clone(),
      file_info_id: self.file_info_id.clone(),
      document_type: self.document_type.clone(),
      bucket_name: self.bucket_name.clone(),
      file_name: self.file_name.clone(),
    }
  }
}

/// Location and identity of a document as reported by the extraction step.
///
/// After extraction this replaces the request as the document reference every
/// downstream state reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
  #[serde(rename = "documentId")]
  pub document_id: String,
  #[serde(rename = "fileInfoId")]
  pub file_info_id: String,
  #[serde(rename = "documentType")]
  pub document_type: String,
  pub bucket_name: String,
  pub file_name: String,
}

impl DocumentRef {
  /// Whether this reference identifies the same document as `request`.
  pub fn matches(&self, request: &WorkflowRequest) -> bool {
    self.document_id == request.document_id && self.file_info_id == request.file_info_id
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn valid() -> serde_json::Value {
    json!({
      "documentId": "a32TV000000n0lFYAQ",
      "fileInfoId": "a2VTV000001I4qz2AC",
      "documentType": "Hospital/Urgent Care",
      "bucket_name": "raw-staging",
      "file_name": "a2VTV000001I4qz2AC.pdf"
    })
  }

  #[test]
  fn test_parses_valid_request() {
    let request = WorkflowRequest::from_json(&valid()).unwrap();
    assert_eq!(request.document_id, "a32TV000000n0lFYAQ");
    assert_eq!(request.file_name, "a2VTV000001I4qz2AC.pdf");
  }

  #[test]
  fn test_reports_every_missing_field() {
    let mut value = valid();
    let object = value.as_object_mut().unwrap();
    object.remove("file_name");
    object.insert("documentId".to_string(), json!("   "));

    let err = WorkflowRequest::from_json(&value).unwrap_err();
    assert_eq!(
      err,
      RequestError::MissingFields {
        fields: vec!["documentId".to_string(), "file_name".to_string()],
      }
    );
    assert_eq!(err.to_string(), "missing required fields: documentId, file_name");
  }

  #[test]
  fn test_non_string_field_is_missing() {
    let mut value = valid();
    value["fileInfoId"] = json!(42);

    let err = WorkflowRequest::from_json(&value).unwrap_err();
    assert!(matches!(err, RequestError::MissingFields { fields } if fields == ["fileInfoId"]));
  }

  #[test]
  fn test_rejects_non_object() {
    let err = WorkflowRequest::from_json(&json!(["documentId"])).unwrap_err();
    assert_eq!(err, RequestError::NotAnObject);
  }

  #[test]
  fn test_document_ref_matches_on_identity() {
    let request = WorkflowRequest::from_json(&valid()).unwrap();
    let mut document = request.document();
    document.file_name = "staged/copy.pdf".to_string();
    assert!(document.matches(&request));

    document.file_info_id = "other".to_string();
    assert!(!document.matches(&request));
  }
}

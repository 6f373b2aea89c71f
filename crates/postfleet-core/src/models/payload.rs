//! Typed task payloads, one schema per task type.
//!
//! The wire keeps `data` as a free JSON object; this module is the validated
//! projection handlers work with. Parsing happens at the queue boundary so a
//! malformed payload never reaches a browser instance.

use crate::models::TaskType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("task data must be a JSON object")]
    NotAnObject,
    #[error("invalid {task_type} payload: {reason}")]
    Invalid { task_type: TaskType, reason: String },
}

/// Listing body stays free-form (it is handed to page scripts verbatim);
/// the envelope fields around it are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleListing {
    #[serde(default)]
    pub vehicle: Value,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemListing {
    #[serde(default)]
    pub item: Value,
    #[serde(default)]
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRef {
    pub listing_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingUpdate {
    pub listing_id: String,
    #[serde(default)]
    pub changes: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    PostVehicle(VehicleListing),
    PostItem(ItemListing),
    ValidateSession,
    RefreshSession,
    DeleteListing(ListingRef),
    UpdateListing(ListingUpdate),
}

impl TaskPayload {
    pub fn parse(task_type: TaskType, data: &Value) -> Result<Self, PayloadError> {
        if !data.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let invalid = |reason: String| PayloadError::Invalid { task_type, reason };

        match task_type {
            TaskType::PostVehicle => serde_json::from_value(data.clone())
                .map(Self::PostVehicle)
                .map_err(|e| invalid(e.to_string())),
            TaskType::PostItem => serde_json::from_value(data.clone())
                .map(Self::PostItem)
                .map_err(|e| invalid(e.to_string())),
            TaskType::ValidateSession => Ok(Self::ValidateSession),
            TaskType::RefreshSession => Ok(Self::RefreshSession),
            TaskType::DeleteListing => {
                let listing: ListingRef =
                    serde_json::from_value(data.clone()).map_err(|e| invalid(e.to_string()))?;
                if listing.listing_id.trim().is_empty() {
                    return Err(invalid("listing_id must not be empty".to_string()));
                }
                Ok(Self::DeleteListing(listing))
            }
            TaskType::UpdateListing => {
                let update: ListingUpdate =
                    serde_json::from_value(data.clone()).map_err(|e| invalid(e.to_string()))?;
                if update.listing_id.trim().is_empty() {
                    return Err(invalid("listing_id must not be empty".to_string()));
                }
                Ok(Self::UpdateListing(update))
            }
        }
    }
}

use serde::{Deserialize, Serialize};

/// Request to place an order through the protected demo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub item: String,
    pub quantity: u32,
    pub customer_reference: Option<String>,
}

impl CreateOrderRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.item.trim().is_empty() {
            errors.push(ValidationError { field: "item".to_string(), message: "item cannot be empty".to_string() });
        }
        if self.quantity == 0 {
            errors.push(ValidationError { field: "quantity".to_string(), message: "quantity must be positive".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

use crate::errors::{DomainError, DomainResult, ValidationError};

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

/// Generic validation implementations
impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        if self.value.is_none() {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: FnOnce(&T) -> Result<(), ValidationError>,
    {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            // Return the first error for simplicity
            Err(DomainError::Validation(self.errors[0].clone()))
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() > max {
                self.errors
                    .push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn not_blank(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.trim().is_empty() {
                self.errors.push(ValidationError::invalid_value(
                    &self.field_name,
                    "must not be blank",
                ));
            }
        }
        self
    }
}

/// Numeric range validation
impl ValidationBuilder<f64> {
    pub fn range(mut self, min: f64, max: f64) -> Self {
        if let Some(value) = &self.value {
            if *value < min || *value > max {
                self.errors
                    .push(ValidationError::range(&self.field_name, min, max));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_none() {
        let result = ValidationBuilder::<String>::new("purpose", None)
            .required()
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn max_length_enforced() {
        let result = ValidationBuilder::new("purpose", Some("x".repeat(300)))
            .max_length(255)
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn range_enforced() {
        assert!(ValidationBuilder::new("latitude", Some(120.0))
            .range(-90.0, 90.0)
            .validate()
            .is_err());
        assert!(ValidationBuilder::new("latitude", Some(45.0))
            .range(-90.0, 90.0)
            .validate()
            .is_ok());
    }
}

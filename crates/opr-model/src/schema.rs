//! Offer schema validation, called out to as a pure function per spec.md
//! §1/§6 ("JSON-schema validation of offers (consumed as a pure function)"
//! is named out of scope; something must still implement it end-to-end).

use opr_patch::Offer;

/// A pure predicate over a candidate offer. Implementations must not
/// perform I/O.
pub trait SchemaValidator: Send + Sync {
    /// Returns `Err` with a human-readable reason when `offer` fails
    /// validation.
    fn validate(&self, offer: &Offer) -> Result<(), String>;
}

/// The default validator: a `jsonschema`-compiled check against the offer
/// shape described in spec.md §3, plus the two numeric invariants the text
/// calls out (`offerExpirationUTC ≥ offerCreationUTC`,
/// `offerUpdateUTC ≥ offerCreationUTC`) that a generic JSON Schema can't
/// express as cleanly as a direct comparison.
pub struct JsonSchemaValidator {
    schema: jsonschema::JSONSchema,
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        let schema_doc = serde_json::json!({
            "type": "object",
            "required": ["id", "offeredBy", "offerCreationUTC", "offerExpirationUTC"],
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "offeredBy": { "type": "string", "minLength": 1 },
                "offerCreationUTC": { "type": "integer" },
                "offerUpdateUTC": { "type": "integer" },
                "offerExpirationUTC": { "type": "integer" },
                "maxReservationTimeSecs": { "type": "integer" },
            },
        });
        let schema = jsonschema::JSONSchema::compile(&schema_doc).expect("offer schema is valid JSON Schema");
        Self { schema }
    }
}

impl Default for JsonSchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, offer: &Offer) -> Result<(), String> {
        let value = serde_json::to_value(offer).map_err(|e| e.to_string())?;
        if let Err(mut errors) = self.schema.validate(&value) {
            return Err(errors.next().map(|e| e.to_string()).unwrap_or_default());
        }
        if offer.offer_expiration_utc < offer.offer_creation_utc {
            return Err("offerExpirationUTC is before offerCreationUTC".to_string());
        }
        if offer.effective_update_utc() < offer.offer_creation_utc {
            return Err("offerUpdateUTC is before offerCreationUTC".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Offer {
        Offer {
            id: "pear".into(),
            offered_by: "https://a".into(),
            offer_creation_utc: 0,
            offer_update_utc: None,
            offer_expiration_utc: 10_000,
            max_reservation_time_secs: None,
            reshare_chain: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn valid_offer_passes() {
        let validator = JsonSchemaValidator::new();
        assert!(validator.validate(&offer()).is_ok());
    }

    #[test]
    fn expiration_before_creation_fails() {
        let validator = JsonSchemaValidator::new();
        let mut bad = offer();
        bad.offer_expiration_utc = -1;
        assert!(validator.validate(&bad).is_err());
    }

    #[test]
    fn missing_id_fails() {
        let validator = JsonSchemaValidator::new();
        let mut bad = offer();
        bad.id = String::new();
        assert!(validator.validate(&bad).is_err());
    }
}

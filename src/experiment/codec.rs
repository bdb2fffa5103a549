//! Flat string encoding of experiment descriptors.
//!
//! The encoding is the descriptor's identity in the ledger:
//!
//! ```text
//! version;model;fusion;dataset;batch_size;rounds;epochs;sample_fraction;proximal_mu;num_parties;run
//! ```
//!
//! Absent `num_parties`/`run` are written as the literal `None`. Floats use the
//! shortest representation that parses back to the same value, so
//! `decode(&encode(d)) == d` holds bit for bit.

use std::str::FromStr;

use thiserror::Error;

use crate::experiment::descriptor::{optional_field, ExperimentDescriptor};

/// Field separator of the key.
pub const DELIMITER: char = ';';

/// Placeholder written for absent optional fields.
pub const NONE_TOKEN: &str = "None";

const FIELD_COUNT: usize = 11;

/// Reasons a key fails to decode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected 11 fields, found {0}")]
    /// Wrong number of `;`-separated fields
    FieldCount(usize),

    #[error("field '{field}' has invalid value '{value}'")]
    /// A field does not parse
    InvalidField {
        /// Field name
        field: &'static str,
        /// Text found
        value: String,
    },
}

/// Encode a descriptor into its ledger key.
pub fn encode(descriptor: &ExperimentDescriptor) -> String {
    format!(
        "{};{};{};{};{};{};{};{:?};{:?};{};{}",
        descriptor.version(),
        descriptor.model(),
        descriptor.fusion(),
        descriptor.dataset(),
        descriptor.batch_size(),
        descriptor.rounds(),
        descriptor.epochs(),
        descriptor.sample_fraction(),
        descriptor.proximal_mu(),
        optional_field(descriptor.num_parties()),
        optional_field(descriptor.run()),
    )
}

/// Decode a ledger key back into a descriptor.
pub fn decode(key: &str) -> Result<ExperimentDescriptor, DecodeError> {
    let fields: Vec<&str> = key.split(DELIMITER).collect();
    if fields.len() != FIELD_COUNT {
        return Err(DecodeError::FieldCount(fields.len()));
    }

    let descriptor = ExperimentDescriptor::builder(fields[0], fields[1], fields[2], fields[3])
        .batch_size(parse_field("batch_size", fields[4])?)
        .rounds(parse_field("rounds", fields[5])?)
        .epochs(parse_field("epochs", fields[6])?)
        .sample_fraction(parse_field("sample_fraction", fields[7])?)
        .proximal_mu(parse_field("proximal_mu", fields[8])?)
        .num_parties(parse_optional("num_parties", fields[9])?)
        .run(parse_optional("run", fields[10])?)
        .build();
    Ok(descriptor)
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_optional<T: FromStr>(field: &'static str, value: &str) -> Result<Option<T>, DecodeError> {
    if value == NONE_TOKEN {
        Ok(None)
    } else {
        parse_field(field, value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> ExperimentDescriptor {
        ExperimentDescriptor::builder("v0.6", "tf-cnn", "FedProx", "cifar10")
            .batch_size(512)
            .rounds(3)
            .epochs(4)
            .sample_fraction(0.75)
            .proximal_mu(1.0)
            .num_parties(Some(4))
            .run(Some(3))
            .build()
    }

    #[test]
    fn encodes_fields_in_order() {
        assert_eq!(
            encode(&full()),
            "v0.6;tf-cnn;FedProx;cifar10;512;3;4;0.75;1.0;4;3"
        );
    }

    #[test]
    fn absent_optionals_use_none_token() {
        let descriptor = ExperimentDescriptor::builder("v0.6", "tf-cnn", "FedAvg", "mnist").build();
        let key = encode(&descriptor);
        assert!(key.ends_with(";None;None"));
        assert_eq!(decode(&key).unwrap(), descriptor);
    }

    #[test]
    fn round_trip_is_exact_for_awkward_floats() {
        let descriptor = ExperimentDescriptor::builder("v1", "tf-cnn", "FedProx", "mnist")
            .sample_fraction(0.1 + 0.2)
            .proximal_mu(1e-7)
            .run(Some(1))
            .build();
        assert_eq!(decode(&encode(&descriptor)).unwrap(), descriptor);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert_eq!(
            decode("v0.6;tf-cnn;FedAvg;mnist;16;3;4;1.0;0.0;4").unwrap_err(),
            DecodeError::FieldCount(10)
        );
        assert_eq!(decode("").unwrap_err(), DecodeError::FieldCount(1));
    }

    #[test]
    fn non_numeric_field_is_rejected() {
        let err = decode("v0.6;tf-cnn;FedAvg;mnist;sixteen;3;4;1.0;0.0;4;1").unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidField {
                field: "batch_size",
                value: "sixteen".to_string()
            }
        );
        assert!(decode("v0.6;tf-cnn;FedAvg;mnist;16;3;4;1.0;0.0;four;1").is_err());
    }

    #[test]
    fn equal_descriptors_share_a_key() {
        assert_eq!(encode(&full()), encode(&full().clone()));
    }
}

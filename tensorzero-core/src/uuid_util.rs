use uuid::Uuid;

use crate::error::{Error, ErrorDetails};

pub fn validate_episode_id(episode_id: Uuid) -> Result<(), Error> {
    validate_tensorzero_uuid(episode_id, "Episode")
}

pub fn validate_inference_id(inference_id: Uuid) -> Result<(), Error> {
    validate_tensorzero_uuid(inference_id, "Inference")
}

pub fn validate_feedback_id(feedback_id: Uuid) -> Result<(), Error> {
    validate_tensorzero_uuid(feedback_id, "Feedback")
}

/// Every id TensorZero mints or accepts from a client must be a UUIDv7 so that storage and
/// the client's own bookkeeping both get a time-ordered, 128-bit id.
fn validate_tensorzero_uuid(uuid: Uuid, kind: &str) -> Result<(), Error> {
    if uuid.get_version_num() != 7 {
        return Err(ErrorDetails::InvalidInferenceId {
            message: format!(
                "{kind} ID must be a UUIDv7, got version {}",
                uuid.get_version_num()
            ),
        }
        .into());
    }
    if uuid.get_variant() != uuid::Variant::RFC4122 {
        return Err(ErrorDetails::InvalidInferenceId {
            message: format!("{kind} ID has an unexpected variant bit pattern"),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid_v7() {
        let id = Uuid::now_v7();
        assert!(validate_episode_id(id).is_ok());
        assert!(validate_inference_id(id).is_ok());
    }

    #[test]
    fn rejects_uuid_v4() {
        let id = Uuid::new_v4();
        assert!(validate_episode_id(id).is_err());
    }

    #[test]
    fn ids_minted_in_sequence_are_monotonic() {
        let ids: Vec<Uuid> = (0..1000).map(|_| Uuid::now_v7()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}

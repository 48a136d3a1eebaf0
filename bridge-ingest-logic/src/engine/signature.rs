use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::{error::ApplyError, types::AgentSignalPayload};

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, ApplyError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|err| ApplyError::SignatureMaterial(format!("{field}: {err}")))
}

/// Verifies the ed25519 signature attached to an agent signal.
///
/// Signals without the full `signature`/`public_key`/`message` triple are
/// accepted unverified. Returns whether a check was performed.
pub(crate) fn verify_agent_signal(payload: &AgentSignalPayload) -> Result<bool, ApplyError> {
    let (Some(signature), Some(public_key), Some(message)) =
        (&payload.signature, &payload.public_key, &payload.message)
    else {
        return Ok(false);
    };

    let public_key: [u8; 32] = decode_hex("public_key", public_key)?
        .try_into()
        .map_err(|_| ApplyError::SignatureMaterial("public_key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&public_key)
        .map_err(|err| ApplyError::SignatureMaterial(format!("public_key: {err}")))?;
    let signature = Signature::from_slice(&decode_hex("signature", signature)?)
        .map_err(|err| ApplyError::SignatureMaterial(format!("signature: {err}")))?;
    let message = decode_hex("message", message)?;

    key.verify(&message, &signature).map_err(|_| {
        ApplyError::InvalidSignature(payload.agent_id.clone().unwrap_or_default())
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed(message: &[u8]) -> AgentSignalPayload {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        AgentSignalPayload {
            agent_id: Some("agent-1".into()),
            signal: Some("HEARTBEAT".into()),
            signature: Some(hex::encode(key.sign(message).to_bytes())),
            public_key: Some(hex::encode(key.verifying_key().to_bytes())),
            message: Some(hex::encode(message)),
            ..Default::default()
        }
    }

    #[test]
    fn valid_signature_passes() {
        assert!(verify_agent_signal(&signed(b"alive")).unwrap());
    }

    #[test]
    fn tampered_message_is_rejected() {
        let mut payload = signed(b"alive");
        payload.message = Some(hex::encode(b"dead"));
        assert!(matches!(
            verify_agent_signal(&payload),
            Err(ApplyError::InvalidSignature(agent)) if agent == "agent-1"
        ));
    }

    #[test]
    fn unsigned_signal_is_not_checked() {
        let payload = AgentSignalPayload {
            agent_id: Some("agent-1".into()),
            ..Default::default()
        };
        assert!(!verify_agent_signal(&payload).unwrap());
    }

    #[test]
    fn malformed_key_is_material_error() {
        let mut payload = signed(b"alive");
        payload.public_key = Some("zz".into());
        assert!(matches!(
            verify_agent_signal(&payload),
            Err(ApplyError::SignatureMaterial(_))
        ));
    }
}

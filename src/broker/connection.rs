//! Pure connection state management for the MQTT broker client
//!
//! Mirrors the state machine in the wire spec: five states, serialized by a
//! single mutex in [`super::client::BrokerClient`], plus a pure backoff
//! function that is property-checkable in isolation from any I/O.

use crate::config::Settings;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;

/// Connection state for the MQTT broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

/// Exponential backoff with a ceiling: `delay(n) = min(initial * mult^n, max)`.
/// Pure function, no internal state - the caller tracks the attempt index.
pub fn backoff_delay(attempt: u32, initial: f64, max: f64, multiplier: f64) -> Duration {
    let delay = initial * multiplier.powi(attempt as i32);
    Duration::from_secs_f64(delay.min(max).max(0.0))
}

/// Certificate verifier that accepts any certificate. Used only when
/// `configure_mqtt_options` determines hostname verification is disabled
/// (§4.1: `tls_enabled` with any of `ca_cert`/`client_cert`/`client_key` left
/// empty).
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build `rumqttc` connection options from validated [`Settings`].
///
/// Per §4.1, when any of `ca_cert`/`client_cert`/`client_key` is left empty,
/// hostname verification is disabled rather than validated against an (in
/// that case, empty and always-rejecting) trust store: we hand rumqttc a
/// custom `rustls::ClientConfig` built with [`NoVerifier`] instead of the
/// CA-backed `TlsConfiguration::Simple`. Only when all three paths are
/// supplied do we load the CA file and client certificate and verify
/// normally.
pub fn configure_mqtt_options(client_id: &str, settings: &Settings) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &settings.broker_address, settings.broker_port);
    options.set_keep_alive(Duration::from_secs(30));

    if !settings.username.is_empty() {
        options.set_credentials(&settings.username, &settings.password);
    }

    if settings.tls_enabled {
        let verification_disabled = settings.ca_cert.is_empty()
            || settings.client_cert.is_empty()
            || settings.client_key.is_empty();

        let tls_config = if verification_disabled {
            let insecure = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            TlsConfiguration::Rustls(Arc::new(insecure))
        } else {
            TlsConfiguration::Simple {
                ca: std::fs::read(&settings.ca_cert).unwrap_or_default(),
                alpn: None,
                client_auth: std::fs::read(&settings.client_cert)
                    .ok()
                    .zip(std::fs::read(&settings.client_key).ok()),
            }
        };
        options.set_transport(Transport::Tls(tls_config));
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_zero_is_initial_when_below_max() {
        assert_eq!(backoff_delay(0, 1.0, 30.0, 2.0), Duration::from_secs_f64(1.0));
    }

    #[test]
    fn s5_backoff_sequence_matches_spec_example() {
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0];
        for (n, want) in expected.iter().enumerate() {
            let got = backoff_delay(n as u32, 1.0, 30.0, 2.0);
            assert_eq!(got, Duration::from_secs_f64(*want), "attempt {n}");
        }
    }

    #[test]
    fn b3_backoff_sequence_with_fractional_params() {
        let expected = [0.1, 0.2, 0.4, 0.8, 0.8];
        for (n, want) in expected.iter().enumerate() {
            let got = backoff_delay(n as u32, 0.1, 0.8, 2.0);
            assert!((got.as_secs_f64() - want).abs() < 1e-9, "attempt {n}");
        }
    }

    #[test]
    fn p4_delay_is_monotonically_nondecreasing_and_bounded() {
        let (initial, max, mult) = (0.5, 12.0, 3.0);
        let mut previous = backoff_delay(0, initial, max, mult);
        for n in 1..20 {
            let current = backoff_delay(n, initial, max, mult);
            assert!(current >= previous);
            assert!(current <= Duration::from_secs_f64(max));
            previous = current;
        }
    }

    #[test]
    fn p4_delay_reaches_and_stays_at_max() {
        let saturated = backoff_delay(10, 1.0, 30.0, 2.0);
        assert_eq!(saturated, Duration::from_secs_f64(30.0));
        let further = backoff_delay(50, 1.0, 30.0, 2.0);
        assert_eq!(further, saturated);
    }

    fn base_settings() -> Settings {
        crate::config::validate(&crate::config::RawConfig::new()).unwrap()
    }

    #[test]
    fn tls_with_all_cert_paths_empty_disables_verification() {
        let mut settings = base_settings();
        settings.tls_enabled = true;
        let options = configure_mqtt_options("client", &settings);
        match options.transport() {
            Transport::Tls(TlsConfiguration::Rustls(_)) => {}
            other => panic!("expected a verification-disabled Rustls transport, got {other:?}"),
        }
    }

    #[test]
    fn tls_with_only_client_key_missing_still_disables_verification() {
        let mut settings = base_settings();
        settings.tls_enabled = true;
        settings.ca_cert = "/tmp/does-not-need-to-exist-ca.pem".to_string();
        settings.client_cert = "/tmp/does-not-need-to-exist-cert.pem".to_string();
        let options = configure_mqtt_options("client", &settings);
        match options.transport() {
            Transport::Tls(TlsConfiguration::Rustls(_)) => {}
            other => panic!("expected a verification-disabled Rustls transport, got {other:?}"),
        }
    }

    #[test]
    fn tls_with_all_cert_paths_set_uses_verified_simple_transport() {
        let mut settings = base_settings();
        settings.tls_enabled = true;
        settings.ca_cert = "/tmp/does-not-need-to-exist-ca.pem".to_string();
        settings.client_cert = "/tmp/does-not-need-to-exist-cert.pem".to_string();
        settings.client_key = "/tmp/does-not-need-to-exist-key.pem".to_string();
        let options = configure_mqtt_options("client", &settings);
        match options.transport() {
            Transport::Tls(TlsConfiguration::Simple { .. }) => {}
            other => panic!("expected a CA-verified Simple transport, got {other:?}"),
        }
    }

    #[test]
    fn tls_disabled_leaves_transport_at_default() {
        let settings = base_settings();
        assert!(!settings.tls_enabled);
        let options = configure_mqtt_options("client", &settings);
        assert!(matches!(options.transport(), Transport::Tcp));
    }
}

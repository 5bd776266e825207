use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::device::types::ExerciseParameters;
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
}

/// Renders the four parameters as the period-terminated settings line and
/// wraps it in base64 for the transport. Pure and total.
pub fn encode_settings(params: &ExerciseParameters) -> Vec<u8> {
    let line = format!(
        "{} {} {} {}.",
        params.initial_delay_ms,
        params.stimulation_time_ms,
        params.rest_time_ms,
        params.stimulation_strength_pct,
    );

    BASE64.encode(line.as_bytes()).into_bytes()
}

/// Parses an inbound settings payload. Returns either a complete parameter
/// set or an error; a partial result is never produced.
pub fn decode_settings(raw: &[u8]) -> Result<ExerciseParameters, DecodeError> {
    let bytes = BASE64.decode(raw).map_err(|_| DecodeError::Transport)?;
    let text = std::str::from_utf8(&bytes).map_err(|_| DecodeError::Transport)?;

    let line = text.trim();
    let line = line.strip_suffix('.').ok_or(DecodeError::MissingTerminator)?;

    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != 4 {
        return Err(DecodeError::FieldCount { count: tokens.len() });
    }

    let mut fields = [0u32; 4];
    for (slot, token) in fields.iter_mut().zip(&tokens) {
        *slot = parse_field(token)?;
    }

    Ok(ExerciseParameters {
        initial_delay_ms: fields[0],
        stimulation_time_ms: fields[1],
        rest_time_ms: fields[2],
        stimulation_strength_pct: fields[3],
    })
}

// <uint> is digits only; u32::from_str alone would also let "+7" through
fn parse_field(token: &str) -> Result<u32, DecodeError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::BadField { token: token.to_string() });
    }

    token.parse::<u32>().map_err(|_| DecodeError::BadField { token: token.to_string() })
}

/// Encodes a control command. The on-wire letter for "start" is `p` and for
/// "pause" is `s`; the firmware expects this literal mapping regardless of
/// the human-facing label.
pub fn encode_command(command: Command) -> Vec<u8> {
    let line = match command {
        Command::Start => "p.",
        Command::Pause => "s.",
    };

    BASE64.encode(line.as_bytes()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(line: &str) -> Vec<u8> {
        BASE64.encode(line.as_bytes()).into_bytes()
    }

    #[test]
    fn settings_round_trip() {
        let params = ExerciseParameters {
            initial_delay_ms: 0,
            stimulation_time_ms: 250,
            rest_time_ms: 750,
            stimulation_strength_pct: 100,
        };

        assert_eq!(decode_settings(&encode_settings(&params)), Ok(params));
    }

    #[test]
    fn conforming_line_round_trips_byte_for_byte() {
        let raw = wrap("12 34 56 78.");
        let decoded = decode_settings(&raw).unwrap();
        assert_eq!(encode_settings(&decoded), raw);
    }

    #[test]
    fn decode_applies_all_four_fields() {
        let params = decode_settings(&wrap("0 250 750 100.")).unwrap();
        assert_eq!(params.initial_delay_ms, 0);
        assert_eq!(params.stimulation_time_ms, 250);
        assert_eq!(params.rest_time_ms, 750);
        assert_eq!(params.stimulation_strength_pct, 100);
    }

    #[test]
    fn decode_trims_surrounding_whitespace() {
        assert!(decode_settings(&wrap("  1 2 3 4.\r\n")).is_ok());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        assert_eq!(decode_settings(&wrap("0 250 750 100")), Err(DecodeError::MissingTerminator));
        assert_eq!(decode_settings(&wrap("")), Err(DecodeError::MissingTerminator));
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert_eq!(decode_settings(&wrap("10 20 30.")), Err(DecodeError::FieldCount { count: 3 }));
        assert_eq!(
            decode_settings(&wrap("1 2 3 4 5.")),
            Err(DecodeError::FieldCount { count: 5 }),
        );
    }

    #[test]
    fn double_space_splits_into_an_extra_empty_field() {
        // splitting is on single spaces; the empty token counts as a field
        assert_eq!(
            decode_settings(&wrap("1  2 3 4.")),
            Err(DecodeError::FieldCount { count: 5 }),
        );
    }

    #[test]
    fn non_integer_field_is_rejected() {
        assert_eq!(
            decode_settings(&wrap("1 2 x 4.")),
            Err(DecodeError::BadField { token: "x".to_string() }),
        );
        assert_eq!(
            decode_settings(&wrap("1 2 -3 4.")),
            Err(DecodeError::BadField { token: "-3".to_string() }),
        );
        assert_eq!(
            decode_settings(&wrap("1 2 +3 4.")),
            Err(DecodeError::BadField { token: "+3".to_string() }),
        );
    }

    #[test]
    fn undecodable_transport_payload_is_rejected() {
        assert_eq!(decode_settings(b"!!not-base64!!"), Err(DecodeError::Transport));
    }

    #[test]
    fn commands_use_the_firmware_letters() {
        assert_eq!(encode_command(Command::Start), wrap("p."));
        assert_eq!(encode_command(Command::Pause), wrap("s."));
    }
}

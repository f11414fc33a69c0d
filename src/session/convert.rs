//! Typed response conversion.
//!
//! A closed set of strategies picked by the requested type: text passthrough
//! for `String`, locale-independent numeric parsing for the primitive
//! numbers, and SCPI boolean parsing for `bool`.

use crate::error::{GpibError, GpibResult};

mod sealed {
    pub trait Sealed {}
}

/// Types a trimmed instrument response can be converted into.
pub trait FromResponse: sealed::Sealed + Sized {
    /// Convert the trimmed response text.
    ///
    /// # Errors
    /// Returns `Format` when the text is not a valid representation.
    fn from_response(text: &str) -> GpibResult<Self>;
}

impl sealed::Sealed for String {}

impl FromResponse for String {
    fn from_response(text: &str) -> GpibResult<Self> {
        Ok(text.to_string())
    }
}

impl sealed::Sealed for bool {}

impl FromResponse for bool {
    fn from_response(text: &str) -> GpibResult<Self> {
        parse_scpi_bool(text)
    }
}

macro_rules! numeric_response {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl FromResponse for $ty {
                fn from_response(text: &str) -> GpibResult<Self> {
                    text.trim().parse::<$ty>().map_err(|_| GpibError::Format {
                        value: text.to_string(),
                        target: stringify!($ty),
                    })
                }
            }
        )*
    };
}

numeric_response!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64, usize);

/// Parse a SCPI boolean: `1`, `0`, `ON`, `OFF`, `TRUE`, `FALSE`, case-insensitive,
/// surrounding whitespace ignored.
///
/// # Errors
/// Returns `Format` for any other token, including the empty string.
pub fn parse_scpi_bool(text: &str) -> GpibResult<bool> {
    let token = text.trim();
    if token == "1" || token.eq_ignore_ascii_case("ON") || token.eq_ignore_ascii_case("TRUE") {
        Ok(true)
    } else if token == "0"
        || token.eq_ignore_ascii_case("OFF")
        || token.eq_ignore_ascii_case("FALSE")
    {
        Ok(false)
    } else {
        Err(GpibError::Format {
            value: text.to_string(),
            target: "bool",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_tokens() {
        for text in ["1", "ON", " on \n", "TRUE", "true"] {
            assert!(parse_scpi_bool(text).expect(text), "{text:?}");
        }
        for text in ["0", "OFF", " off\r", "FALSE", "False"] {
            assert!(!parse_scpi_bool(text).expect(text), "{text:?}");
        }
        for text in ["MAYBE", "2", "", " YES "] {
            assert!(
                matches!(parse_scpi_bool(text), Err(GpibError::Format { .. })),
                "{text:?}"
            );
        }
    }

    #[test]
    fn test_numeric_uses_fixed_format() {
        assert_eq!(f64::from_response("+1.234500E+00").expect("float"), 1.2345);
        assert_eq!(f64::from_response(" -42.5 ").expect("float"), -42.5);
        assert_eq!(i32::from_response("+17").expect("int"), 17);
        // decimal comma is never accepted
        assert!(f64::from_response("1,5").is_err());
        assert!(u8::from_response("300").is_err());
    }

    #[test]
    fn test_string_passthrough() {
        assert_eq!(
            String::from_response("ACME,DMM,1,2").expect("text"),
            "ACME,DMM,1,2"
        );
    }
}

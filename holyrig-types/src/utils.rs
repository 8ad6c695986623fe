//! Functions that may come in handy.

/// Converts frame bytes into the dotted-hex form used in model files,
/// logs, and test failure output, e.g. `FE.FE.94.E0.03.FD`.
pub fn hex_frame<B>(bytes: B) -> String
where
    B: AsRef<[u8]>,
{
    bytes
        .as_ref()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<String>>()
        .join(".")
}

//! Small argument builders for FSL maths tools.

use crate::value::Value;

/// `fslmaths` operation mapping the intensity range `[min, max]` onto
/// `[-π, π]`: shift by `-min`, divide by `max + min`, scale by 2π, subtract
/// π.
pub fn scale_to_pi(min: f64, max: f64) -> String {
    // `+ 0.0` turns a negative zero into a positive one.
    let shift = -min + 0.0;
    let divisor = max + min + 0.0;
    format!("-add {shift:.10} -div {divisor:.10} -mul 6.28318530718 -sub 3.14159265359")
}

/// Parses the `<min> <max>` line printed by `fslstats -R`.
pub fn parse_range(text: &str) -> Option<(f64, f64)> {
    let mut numbers = text.split_whitespace().map(str::parse::<f64>);
    let min = numbers.next()?.ok()?;
    let max = numbers.next()?.ok()?;
    if numbers.next().is_some() {
        return None;
    }
    Some((min, max))
}

/// Splits files into the first one and `-add <file>` operands for the rest,
/// the argument shape `fslmaths` needs to sum images.
pub fn multi_maths_operands(files: &[Value]) -> Option<(Value, Vec<Value>)> {
    let (first, rest) = files.split_first()?;
    let operands = rest
        .iter()
        .flat_map(|file| [Value::from("-add"), file.clone()])
        .collect();
    Some((first.clone(), operands))
}

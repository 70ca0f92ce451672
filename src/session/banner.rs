//! Bordered ASCII banners for end-of-session messages.

/// Frames the lines in a star border, centered, padded with blank lines so
/// the message stands out of the session's terminal scrollback.
pub fn border_message(lines: &[&str]) -> String {
    const AROUND: usize = 2;

    let lines: Vec<&str> = lines.iter().map(|line| line.trim()).collect();
    let widths: Vec<usize> = lines.iter().map(|line| line.chars().count()).collect();
    let max_width = widths.iter().copied().max().unwrap_or(0);

    let mut out = String::new();
    out.push_str(&"\n".repeat(AROUND + 1));
    out.push_str(&"*".repeat(max_width + 6));
    out.push('\n');
    out.push_str(&format!("*  {}  *\n", " ".repeat(max_width)));
    for (line, width) in lines.iter().zip(&widths) {
        let pad = max_width - width;
        let left = pad / 2;
        out.push_str(&format!(
            "*  {}{}{}  *\n",
            " ".repeat(left),
            line,
            " ".repeat(pad - left)
        ));
    }
    out.push_str(&format!("*  {}  *\n", " ".repeat(max_width)));
    out.push_str(&"*".repeat(max_width + 6));
    out.push('\n');
    out.push_str(&"\n".repeat(AROUND));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_and_centers() {
        let banner = border_message(&["Kicked out due to inactivity"]);
        let lines: Vec<&str> = banner.lines().collect();
        assert!(banner.contains("*  Kicked out due to inactivity  *"));
        // Top and bottom borders match the widest line.
        let border = "*".repeat("Kicked out due to inactivity".len() + 6);
        assert_eq!(lines.iter().filter(|l| **l == border).count(), 2);

        let two = border_message(&["Server is shutting down,", "sorry for the inconvenience"]);
        assert!(two.contains("*  sorry for the inconvenience  *"));
        // The shorter line is centered within the widest.
        assert!(two.contains("*   Server is shutting down,    *"));
    }
}

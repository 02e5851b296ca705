use serde::{Deserialize, Serialize};

/// How many lines after a `!` fatal marker are searched for the `l.<N>` cursor
const FATAL_LOOKAHEAD: usize = 5;
/// Upper bound on warning continuation lines
const WARNING_CONTINUATION: usize = 8;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

/// One structured diagnostic derived from raw compiler output. `line` is 0
/// when the log did not carry one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub file: String,
    pub line: u32,
    pub message: String,
}

pub fn error_count(entries: &[LogEntry]) -> u32 {
    entries.iter().filter(|e| e.level == LogLevel::Error).count() as u32
}

pub fn warning_count(entries: &[LogEntry]) -> u32 {
    entries.iter().filter(|e| e.level == LogLevel::Warning).count() as u32
}

/// Turns a raw TeX compiler log into structured entries.
///
/// Recognized per line, in priority order: `path:line: message` errors,
/// `! message` fatals (with a bounded lookahead for the `l.<N>` cursor),
/// the two warning families (continued until a sentence-ending period),
/// and over/underfull box notices. Entries without an explicit file are
/// attributed to the current file tracked from parenthesised open markers.
pub fn parse(raw: &str) -> Vec<LogEntry> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut entries = Vec::new();
    let mut context = FileContext::default();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(entry) = parse_file_line_error(line) {
            entries.push(entry);
            i += 1;
            continue;
        }

        if let Some(message) = line.strip_prefix("! ") {
            let mut line_no = 0;
            for &follow in lines.iter().skip(i + 1).take(FATAL_LOOKAHEAD) {
                if let Some(n) = parse_error_cursor(follow) {
                    line_no = n;
                    break;
                }
            }
            entries.push(LogEntry {
                level: LogLevel::Error,
                file: context.current(),
                line: line_no,
                message: message.trim().to_string(),
            });
            i += 1;
            continue;
        }

        if let Some(start) = warning_text(line) {
            let mut message = start.trim().to_string();
            let mut continued = 0;
            while !message.ends_with('.')
                && continued < WARNING_CONTINUATION
                && i + 1 < lines.len()
                && !lines[i + 1].trim().is_empty()
            {
                i += 1;
                continued += 1;
                message.push(' ');
                message.push_str(lines[i].trim());
            }
            entries.push(LogEntry {
                level: LogLevel::Warning,
                file: context.current(),
                line: trailing_input_line(&message),
                message,
            });
            i += 1;
            continue;
        }

        if line.starts_with("Overfull ") || line.starts_with("Underfull ") {
            entries.push(LogEntry {
                level: LogLevel::Info,
                file: context.current(),
                line: box_notice_line(line),
                message: line.trim().to_string(),
            });
            i += 1;
            continue;
        }

        context.update(line);
        i += 1;
    }

    entries
}

/// `path:line: message`, the shape produced by -file-line-error
fn parse_file_line_error(line: &str) -> Option<LogEntry> {
    let (head, rest) = line.split_once(':')?;
    let (num, message) = rest.split_once(':')?;
    let line_no: u32 = num.parse().ok()?;
    if head.is_empty() || head.contains(' ') {
        return None;
    }
    // Require something path-shaped to the left of the first colon
    if !head.contains('.') && !head.contains('/') {
        return None;
    }
    Some(LogEntry {
        level: LogLevel::Error,
        file: head.to_string(),
        line: line_no,
        message: message.trim().to_string(),
    })
}

/// `l.27 some text` following a fatal marker
fn parse_error_cursor(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("l.")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// The two warning families: `LaTeX Warning:` and `Package <name> Warning:`
fn warning_text(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("LaTeX Warning:") {
        return Some(rest);
    }
    if line.starts_with("Package ") {
        if let Some(pos) = line.find(" Warning:") {
            return Some(&line[pos + " Warning:".len()..]);
        }
    }
    None
}

/// Trailing `on input line <N>` fragment, 0 when absent
fn trailing_input_line(message: &str) -> u32 {
    let marker = "on input line ";
    let Some(idx) = message.rfind(marker) else {
        return 0;
    };
    let digits: String = message[idx + marker.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// `at line <N>` or `at lines <N>--<M>` in a box notice; the first number wins
fn box_notice_line(line: &str) -> u32 {
    let idx = match (line.find("at lines "), line.find("at line ")) {
        (Some(idx), _) => idx + "at lines ".len(),
        (None, Some(idx)) => idx + "at line ".len(),
        (None, None) => return 0,
    };
    let digits: String = line[idx..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Running current-file context, fed by the parenthesis-delimited open
/// markers TeX writes as it enters and leaves input files.
#[derive(Default)]
struct FileContext {
    stack: Vec<String>,
}

impl FileContext {
    fn current(&self) -> String {
        self.stack.last().cloned().unwrap_or_default()
    }

    fn update(&mut self, line: &str) {
        let mut skip_until = 0;
        for (idx, c) in line.char_indices() {
            if idx < skip_until {
                continue;
            }
            match c {
                '(' => {
                    let rest = &line[idx + 1..];
                    if rest.starts_with("./") || rest.starts_with('/') {
                        let end = rest
                            .find(|ch: char| ch == ')' || ch == '(' || ch.is_whitespace())
                            .unwrap_or(rest.len());
                        self.stack.push(rest[..end].to_string());
                        skip_until = idx + 1 + end;
                    }
                }
                ')' => {
                    self.stack.pop();
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_line_error() {
        let entries = parse("./main.tex:12: Undefined control sequence.");
        assert_eq!(
            entries,
            vec![LogEntry {
                level: LogLevel::Error,
                file: "./main.tex".to_string(),
                line: 12,
                message: "Undefined control sequence.".to_string(),
            }]
        );
    }

    #[test]
    fn fatal_marker_with_cursor_lookahead() {
        let raw = "! Missing $ inserted.\n<inserted text>\n                $\nl.27 some text";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].line, 27);
        assert_eq!(entries[0].message, "Missing $ inserted.");
    }

    #[test]
    fn fatal_marker_without_cursor_reports_line_zero() {
        let entries = parse("! Emergency stop.");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line, 0);
    }

    #[test]
    fn latex_warning_with_input_line() {
        let raw = "LaTeX Warning: Reference 'x' on page 1 undefined on input line 45.";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warning);
        assert_eq!(entries[0].line, 45);
    }

    #[test]
    fn package_warning_continues_to_sentence_end() {
        let raw = "Package hyperref Warning: Token not allowed in a PDF string\n\
                   (Unicode): removing `\\\\' on input line 73.";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warning);
        assert_eq!(entries[0].line, 73);
        assert!(entries[0].message.contains("removing"));
    }

    #[test]
    fn box_notice_is_informational() {
        let raw = "Overfull \\hbox (12.5pt too wide) in paragraph at lines 33--35";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].line, 33);
    }

    #[test]
    fn fatal_attributed_to_current_open_file() {
        let raw = "(./main.tex (./chapters/two.tex\n! Undefined control sequence.\nl.4 \\oops";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file, "./chapters/two.tex");
        assert_eq!(entries[0].line, 4);
    }

    #[test]
    fn closing_paren_pops_file_context() {
        let raw = "(./main.tex (./a.tex) \n! Boom.";
        let entries = parse(raw);
        assert_eq!(entries[0].file, "./main.tex");
    }

    #[test]
    fn counts_split_by_level() {
        let raw = "./main.tex:1: bad\nLaTeX Warning: watch out.\nOverfull \\hbox at lines 2--3";
        let entries = parse(raw);
        assert_eq!(error_count(&entries), 1);
        assert_eq!(warning_count(&entries), 1);
        assert_eq!(entries.len(), 3);
    }
}

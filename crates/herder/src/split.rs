/// Split a shell-like command line into arguments.
///
/// Whitespace separates tokens unless it sits inside `'...'` or `"..."`.
/// Quote characters end the current token and are dropped; the other quote
/// character is literal inside a quoted run. A backslash makes the next
/// character literal (the backslash is kept). Nothing is expanded, so `$VAR`
/// passes through untouched.
pub fn split_command(cmd: &str) -> Vec<String> {
	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut quote: Option<char> = None;
	let mut escaped = false;

	for c in cmd.chars() {
		if escaped {
			escaped = false;
			current.push(c);
			continue;
		}

		match c {
			'\\' => {
				escaped = true;
				current.push(c);
			}
			'"' | '\'' if quote.is_none() => {
				quote = Some(c);
				flush(&mut tokens, &mut current);
			}
			c if quote == Some(c) => {
				quote = None;
				flush(&mut tokens, &mut current);
			}
			c if c.is_whitespace() && quote.is_none() => flush(&mut tokens, &mut current),
			c => current.push(c),
		}
	}
	flush(&mut tokens, &mut current);
	tokens
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
	if !current.is_empty() {
		tokens.push(std::mem::take(current));
	}
}

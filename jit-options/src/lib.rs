//! This library parses the option strings handed to the jit, in the form
//! `-Xjit:enableRATPurging,classExtendRatSize=3079,verbose={inlining|runtimeAssumptions}`.
//! Options are separated by commas. Each one is a name, optionally followed by `=` and a value.
//! A value is either a run of characters up to the next comma, or a braced group which may itself
//! contain commas.
//! The names are not interpreted here, that's up to whoever consumes the [`JitOptions`].

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOption {
    pub name: String,
    /// `None` if the option was just a name, which acts as a flag
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitOptions {
    // Kept in the order they were written in, later duplicates replace earlier ones
    options: Vec<JitOption>,
}
impl JitOptions {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JitOption> {
        self.options.iter().find(|opt| opt.name == name)
    }

    /// Whether the option was given at all (with or without a value)
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|opt| opt.value.as_deref())
    }

    /// Parse the value of the option as an unsigned integer.
    /// Decimal and `0x` prefixed hex are accepted.
    pub fn value_usize(&self, name: &str) -> Result<Option<usize>, OptionValueError> {
        let value = if let Some(value) = self.value(name) {
            value
        } else {
            return Ok(None);
        };

        let parsed = if let Some(hex) = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            usize::from_str_radix(hex, 16)
        } else {
            value.parse::<usize>()
        };

        parsed.map(Some).map_err(|_| OptionValueError::NotAnInteger {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    /// The elements of a braced `{a|b|c}` value
    #[must_use]
    pub fn value_list(&self, name: &str) -> Vec<&str> {
        self.value(name)
            .map(|value| {
                let value = value
                    .strip_prefix('{')
                    .and_then(|v| v.strip_suffix('}'))
                    .unwrap_or(value);
                value.split('|').filter(|v| !v.is_empty()).collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JitOption> {
        self.options.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.options.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OptionParseError {
    /// We expected the starting character for a name but got nothing
    ExpectedNameGotEof,
    /// We expected the starting character for a name to be alphanumeric
    ExpectedNameAlphanumeric(char),
    /// We expected this character to come next
    Expected(char),
    /// A braced value was never closed
    UnclosedBrace,
    /// The value after `=` was empty
    EmptyValue,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OptionValueError {
    NotAnInteger { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionWarning<'a> {
    DuplicateOption(&'a str),
}

/// The prefix that option strings are commonly given with on a command line
pub const OPTION_PREFIX: &str = "-Xjit:";

pub fn parse_jit_options<'a>(
    input_data: &'a str,
    mut warning_output: impl FnMut(OptionWarning<'a>),
) -> Result<JitOptions, OptionParseError> {
    let mut result = JitOptions::default();

    let mut data = input_data.strip_prefix(OPTION_PREFIX).unwrap_or(input_data);
    if data.is_empty() {
        return Ok(result);
    }

    loop {
        let (d, name) = parse_name(data)?;

        let (d, value) = if let Ok(d) = expect(d, '=') {
            let (d, value) = parse_value(d)?;
            (d, Some(value))
        } else {
            (d, None)
        };

        let option = JitOption {
            name: name.to_owned(),
            value: value.map(str::to_owned),
        };
        if let Some(existing) = result.options.iter_mut().find(|opt| opt.name == name) {
            warning_output(OptionWarning::DuplicateOption(name));
            *existing = option;
        } else {
            result.options.push(option);
        }

        if d.is_empty() {
            break;
        }

        data = expect(d, ',')?;
        // Allow a trailing comma
        if data.is_empty() {
            break;
        }
    }

    Ok(result)
}

/// Returns (data, name)
fn parse_name(data: &str) -> Result<(&str, &str), OptionParseError> {
    let first = data
        .chars()
        .next()
        .ok_or(OptionParseError::ExpectedNameGotEof)?;
    if !first.is_ascii_alphanumeric() {
        return Err(OptionParseError::ExpectedNameAlphanumeric(first));
    }

    let mut end = 1;
    for (i, x) in data.char_indices().skip(1) {
        if x.is_ascii_alphanumeric() || x == '-' || x == '_' || x == '.' {
            end = i + x.len_utf8();
        } else {
            // Not part of the name, we'll let the caller handle it
            break;
        }
    }

    Ok((&data[end..], &data[..end]))
}

/// The `=` should already be parsed
/// Returns (data, value)
fn parse_value(data: &str) -> Result<(&str, &str), OptionParseError> {
    if data.starts_with('{') {
        let mut depth = 0usize;
        for (i, c) in data.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = i + 1;
                        return Ok((&data[end..], &data[..end]));
                    }
                }
                _ => {}
            }
        }

        Err(OptionParseError::UnclosedBrace)
    } else {
        let end = data.find(',').unwrap_or(data.len());
        if end == 0 {
            return Err(OptionParseError::EmptyValue);
        }

        Ok((&data[end..], &data[..end]))
    }
}

fn expect(data: &str, c: char) -> Result<&str, OptionParseError> {
    if let Some(data) = data.strip_prefix(c) {
        Ok(data)
    } else {
        Err(OptionParseError::Expected(c))
    }
}

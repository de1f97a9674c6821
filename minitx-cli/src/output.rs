use clap::ValueEnum;
use strum::Display;
use tabled::builder::Builder;
use tabled::settings::Style;

#[derive(Debug, ValueEnum, Clone, Copy, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputStyle {
    #[default]
    Sharp,
    Modern,
    Psql,
    Markdown,
}

/// Renders `rows` under `header` as a table.
pub fn render<R>(header: &[&str], rows: R, style: OutputStyle) -> String
where
    R: IntoIterator<Item = Vec<String>>,
{
    let mut builder = Builder::default();
    builder.push_record(header.iter().copied());
    for row in rows {
        builder.push_record(row);
    }
    let mut table = builder.build();
    match style {
        OutputStyle::Sharp => table.with(Style::sharp()),
        OutputStyle::Modern => table.with(Style::modern()),
        OutputStyle::Psql => table.with(Style::psql()),
        OutputStyle::Markdown => table.with(Style::markdown()),
    };
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_markdown() {
        let table = render(
            &["gtrid", "resources"],
            vec![vec!["abc".to_string(), "A, B".to_string()]],
            OutputStyle::Markdown,
        );
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("gtrid"));
        assert!(lines[2].contains("A, B"));
    }
}

use std::io::{IsTerminal, Write};

use anstream::{AutoStream, ColorChoice};
use anstyle::Style;

use crate::ui::renderer::{Renderer, UiResult};
use crate::ui::theme::{resolve_color_enabled, OutputMode, Theme};
use crate::ui::widgets::{KeyValue, MessageBlock, SummaryCounts, TableSpec};

pub struct PlainRenderer<W: Write> {
    writer: W,
    color_enabled: bool,
    theme: Theme,
}

impl<W: Write> PlainRenderer<W> {
    pub fn new(writer: W, color_enabled: bool) -> Self {
        Self {
            writer,
            color_enabled,
            theme: Theme::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn style_text(&self, style: Style, text: &str) -> String {
        if !self.color_enabled {
            return text.to_owned();
        }
        format!("{}{}{}", style.render(), text, style.render_reset())
    }

    fn write_block(&mut self, label: &str, style: Style, block: &MessageBlock) -> UiResult<()> {
        let marker = self.style_text(style, label);
        writeln!(self.writer, "{marker} {}", block.title)?;
        for line in block.body.lines() {
            writeln!(self.writer, "  {line}")?;
        }
        if let Some(hint) = &block.hint {
            let hint_label = self.style_text(self.theme.muted, "hint");
            writeln!(self.writer, "  {hint_label}: {hint}")?;
        }
        Ok(())
    }
}

fn color_choice(mode: OutputMode) -> ColorChoice {
    match mode {
        OutputMode::Auto => ColorChoice::Auto,
        OutputMode::Always => ColorChoice::AlwaysAnsi,
        OutputMode::Never => ColorChoice::Never,
    }
}

impl PlainRenderer<AutoStream<std::io::Stdout>> {
    pub fn stdout(mode: OutputMode) -> Self {
        let stream = AutoStream::new(std::io::stdout(), color_choice(mode));
        Self::new(
            stream,
            resolve_color_enabled(mode, std::io::stdout().is_terminal()),
        )
    }
}

impl PlainRenderer<AutoStream<std::io::Stderr>> {
    pub fn stderr(mode: OutputMode) -> Self {
        let stream = AutoStream::new(std::io::stderr(), color_choice(mode));
        Self::new(
            stream,
            resolve_color_enabled(mode, std::io::stderr().is_terminal()),
        )
    }
}

impl<W: Write> Renderer for PlainRenderer<W> {
    fn text(&mut self, body: &str) -> UiResult<()> {
        write!(self.writer, "{body}")?;
        if !body.ends_with('\n') {
            writeln!(self.writer)?;
        }
        Ok(())
    }

    fn section(&mut self, title: &str) -> UiResult<()> {
        let rendered = self.style_text(self.theme.accent, title);
        let underline = self.style_text(self.theme.muted, &"─".repeat(title.chars().count()));
        writeln!(self.writer, "{rendered}")?;
        writeln!(self.writer, "{underline}")?;
        Ok(())
    }

    fn bullet_list(&mut self, title: &str, items: &[String]) -> UiResult<()> {
        writeln!(self.writer, "{title}:")?;
        if items.is_empty() {
            writeln!(self.writer, "- <none>")?;
            return Ok(());
        }
        for item in items {
            writeln!(self.writer, "- {item}")?;
        }
        Ok(())
    }

    fn error_block(&mut self, block: &MessageBlock) -> UiResult<()> {
        self.write_block("[error]", self.theme.error, block)
    }

    fn warning_block(&mut self, block: &MessageBlock) -> UiResult<()> {
        self.write_block("[warning]", self.theme.warning, block)
    }

    fn key_values(&mut self, items: &[KeyValue]) -> UiResult<()> {
        for item in items {
            let key = self.style_text(self.theme.label, &item.key);
            let value = self.style_text(self.theme.value, &item.value);
            writeln!(self.writer, "{key}: {value}")?;
        }
        Ok(())
    }

    fn summary(&mut self, counts: SummaryCounts) -> UiResult<()> {
        let ok = self.style_text(self.theme.success, &counts.ok.to_string());
        let pending = self.style_text(self.theme.warning, &counts.pending.to_string());
        let failed = self.style_text(self.theme.error, &counts.failed.to_string());
        writeln!(
            self.writer,
            "summary  ok:{ok}  pending:{pending}  failed:{failed}"
        )?;
        Ok(())
    }

    fn table(&mut self, spec: &TableSpec) -> UiResult<()> {
        writeln!(self.writer, "{}", spec.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(renderer: PlainRenderer<Vec<u8>>) -> String {
        String::from_utf8(renderer.into_inner()).expect("utf8")
    }

    #[test]
    fn renders_blocks_without_color_when_disabled() {
        let mut renderer = PlainRenderer::new(Vec::<u8>::new(), false);

        renderer
            .error_block(
                &MessageBlock::new("Config invalid", "duplicate vm name: sup-M1-0")
                    .with_hint("Each [[vm]] entry needs a unique name"),
            )
            .expect("render error block");

        assert_eq!(
            rendered(renderer),
            "[error] Config invalid\n  duplicate vm name: sup-M1-0\n  hint: Each [[vm]] entry needs a unique name\n"
        );
    }

    #[test]
    fn multi_line_block_bodies_stay_indented() {
        let mut renderer = PlainRenderer::new(Vec::<u8>::new(), false);
        renderer
            .warning_block(&MessageBlock::new("Cancelled", "child stopped\nsignal=15"))
            .expect("warning block");

        assert_eq!(
            rendered(renderer),
            "[warning] Cancelled\n  child stopped\n  signal=15\n"
        );
    }

    #[test]
    fn renders_section_and_summary_without_color_when_disabled() {
        let mut renderer = PlainRenderer::new(Vec::<u8>::new(), false);

        renderer.section("Deployment").expect("section");
        renderer
            .summary(SummaryCounts {
                ok: 4,
                pending: 1,
                failed: 0,
            })
            .expect("summary");

        assert_eq!(
            rendered(renderer),
            "Deployment\n──────────\nsummary  ok:4  pending:1  failed:0\n"
        );
    }

    #[test]
    fn renders_bullet_list_and_table_without_color_when_disabled() {
        let mut renderer = PlainRenderer::new(Vec::<u8>::new(), false);
        renderer
            .bullet_list("failed", &["sup-B2-0: Unreachable: SSH failed".to_owned()])
            .expect("bullet list");
        renderer
            .table(&TableSpec::new(
                ["VM", "Status"],
                vec![vec!["sup-M1-0".to_owned(), "completed".to_owned()]],
            ))
            .expect("table");

        let output = rendered(renderer);
        assert!(output.contains("failed:\n- sup-B2-0: Unreachable: SSH failed"));
        assert!(output.contains("VM"));
        assert!(output.contains("sup-M1-0"));
        assert!(output.contains("completed"));
    }

    #[test]
    fn colors_wrap_styled_text_when_enabled() {
        let mut renderer = PlainRenderer::new(Vec::<u8>::new(), true);
        renderer
            .error_block(&MessageBlock::new("Session failed", "child exited: code=3"))
            .expect("error block");

        let output = rendered(renderer);
        assert!(output.contains("\u{1b}["));
        assert!(output.contains("Session failed\n"));
        assert!(output.ends_with("  child exited: code=3\n"));
    }
}

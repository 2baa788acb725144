//! Cursor and block navigation over the rendered output buffer.
//!
//! The output pane is a sequence of blocks (one per command), each a run of
//! lines. The cursor addresses a line as `(block, line)` plus the line's row
//! within the visible viewport. Block heights change between renders as
//! output streams in and blocks collapse, so every movement reduces to
//! "apply a raw delta, then re-home the cursor against the current heights".

/// Position within the output buffer. `line == block size` is a valid
/// end-of-block position; on the last block it is the end sentinel callers
/// scroll up from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub block: usize,
    pub line: usize,
    pub line_in_view: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    LineUp,
    LineDown,
    PageUp,
    PageDown,
    JumpBlockUp,
    JumpBlockDown,
}

/// Re-home an out-of-range `(block, line)` pair against `sizes`.
///
/// Structural recursion: a positive overshoot is carried forward block by
/// block, a negative one backward, and each step strictly shrinks the
/// remaining distance, so this terminates for any finite input.
pub fn normalize(block: i64, line: i64, sizes: &[usize]) -> (usize, usize) {
    if sizes.is_empty() || block < 0 {
        return (0, 0);
    }
    let last = sizes.len() - 1;
    if block as usize > last {
        return (last, sizes[last]);
    }
    let size = sizes[block as usize] as i64;
    if line > size {
        return normalize(block + 1, line - size, sizes);
    }
    if line < 0 {
        if block < 1 {
            return (0, 0);
        }
        return normalize(block - 1, line + sizes[block as usize - 1] as i64, sizes);
    }
    (block as usize, line as usize)
}

/// Absolute offset of the cursor's line within the whole output buffer.
pub fn buffer_index(cursor: Cursor, sizes: &[usize]) -> usize {
    let block = cursor.block.min(sizes.len());
    sizes[..block].iter().sum::<usize>() + cursor.line
}

/// Apply one movement action and return the corrected cursor.
///
/// The viewport row follows the cursor: it shifts by the same buffer
/// distance the cursor moved, clamped into the viewport and never above the
/// top of the buffer.
pub fn scroll(cursor: Cursor, sizes: &[usize], view_height: usize, action: ScrollAction) -> Cursor {
    if sizes.is_empty() {
        return Cursor::default();
    }

    // Heights may have changed since the cursor was last corrected.
    let (block, line) = normalize(cursor.block as i64, cursor.line as i64, sizes);
    let at = Cursor {
        block,
        line,
        line_in_view: cursor.line_in_view,
    };

    let page = view_height.max(1) as i64;
    let (raw_block, raw_line) = match action {
        ScrollAction::LineUp => (at.block as i64, at.line as i64 - 1),
        ScrollAction::LineDown => (at.block as i64, at.line as i64 + 1),
        ScrollAction::PageUp => (at.block as i64, at.line as i64 - page),
        ScrollAction::PageDown => (at.block as i64, at.line as i64 + page),
        ScrollAction::JumpBlockDown => (at.block as i64 + 1, 0),
        ScrollAction::JumpBlockUp if at.line > 0 => (at.block as i64, 0),
        ScrollAction::JumpBlockUp => (at.block as i64 - 1, 0),
    };
    let (new_block, new_line) = normalize(raw_block, raw_line, sizes);

    let old_idx = buffer_index(at, sizes) as i64;
    let new_idx = buffer_index(
        Cursor {
            block: new_block,
            line: new_line,
            line_in_view: 0,
        },
        sizes,
    ) as i64;
    let in_view = (at.line_in_view as i64 + (new_idx - old_idx))
        .clamp(0, page - 1)
        .min(new_idx)
        .max(0);

    Cursor {
        block: new_block,
        line: new_line,
        line_in_view: in_view as usize,
    }
}

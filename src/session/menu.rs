//! The task-selection prompt shown to terminal users.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::trie::Trie;
use crate::core::Image;

const MAX_ATTEMPTS: u32 = 3;

/// Orders names the way humans expect: digit runs compare numerically, so
/// `task2` sorts before `task10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&x), Some(&y)) => {
                if x.is_ascii_digit() && y.is_ascii_digit() {
                    let a_run = a.iter().take_while(|c| c.is_ascii_digit()).count();
                    let b_run = b.iter().take_while(|c| c.is_ascii_digit()).count();
                    let a_num = &a[..a_run];
                    let b_num = &b[..b_run];
                    let a_trim = a_num.iter().position(|&c| c != b'0').unwrap_or(a_run);
                    let b_trim = b_num.iter().position(|&c| c != b'0').unwrap_or(b_run);
                    let ord = (a_run - a_trim)
                        .cmp(&(b_run - b_trim))
                        .then_with(|| a_num[a_trim..].cmp(&b_num[b_trim..]))
                        .then_with(|| a_run.cmp(&b_run));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    a = &a[a_run..];
                    b = &b[b_run..];
                } else {
                    if x != y {
                        return x.cmp(&y);
                    }
                    a = &a[1..];
                    b = &b[1..];
                }
            }
        }
    }
}

/// Presents the visible images and reads a selection, with tab completion and
/// up to three attempts. `Ok(None)` means the user failed to pick one or hung
/// up.
pub async fn select_image<R, W>(
    reader: &mut R,
    writer: &mut W,
    images: &HashMap<String, Arc<Image>>,
) -> std::io::Result<Option<Arc<Image>>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut names: Vec<&str> = images.keys().map(String::as_str).collect();
    names.sort_by(|a, b| natural_cmp(a, b));

    let mut completions = Trie::new();
    writer.write_all(b"Available tasks:\r\n\r\n").await?;
    for name in &names {
        completions.add(name);
        writer.write_all(name.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"\r\n").await?;

    for _ in 0..MAX_ATTEMPTS {
        let Some(line) = read_line(reader, writer, "Select the task: ", &completions).await? else {
            return Ok(None);
        };
        let selected = line.trim().to_lowercase();
        if let Some(image) = images.get(&selected) {
            return Ok(Some(image.clone()));
        }
        debug!("no task named {:?}", selected);
        writer.write_all(b"Not found!\r\n").await?;
    }
    writer.write_all(b"Failed to select the task\r\n").await?;
    Ok(None)
}

/// Minimal line editor over a raw byte stream: echo, backspace, and trie
/// completion on tab. `Ok(None)` on EOF or interrupt.
async fn read_line<R, W>(
    reader: &mut R,
    writer: &mut W,
    prompt: &str,
    completions: &Trie,
) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(prompt.as_bytes()).await?;
    writer.flush().await?;

    let mut line: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        match byte[0] {
            b'\r' | b'\n' => {
                writer.write_all(b"\r\n").await?;
                writer.flush().await?;
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            b'\t' => {
                let typed = String::from_utf8_lossy(&line).to_lowercase();
                let (continuation, exact) = completions.search(&typed);
                if !continuation.is_empty() {
                    line.extend_from_slice(continuation.as_bytes());
                    writer.write_all(continuation.as_bytes()).await?;
                    if exact {
                        line.push(b' ');
                        writer.write_all(b" ").await?;
                    }
                    writer.flush().await?;
                }
            }
            0x7f | 0x08 => {
                if line.pop().is_some() {
                    writer.write_all(b"\x08 \x08").await?;
                    writer.flush().await?;
                }
            }
            // Ctrl-C / Ctrl-D end the prompt.
            0x03 | 0x04 => return Ok(None),
            c if (0x20..0x7f).contains(&c) => {
                line.push(c);
                writer.write_all(&[c]).await?;
                writer.flush().await?;
            }
            _ => {}
        }
    }
}

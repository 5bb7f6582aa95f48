//! Fixtures shared by the unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fs::File,
    io::Write,
    path::Path,
};

use zip::{write::SimpleFileOptions, ZipWriter};

use crate::{error::PlacerError, ui::Prompt};

/// Answers confirmations from a fixed script; panics when the script runs out.
pub struct ScriptedPrompt {
    answers: RefCell<VecDeque<bool>>,
    asked: Cell<usize>,
}

impl ScriptedPrompt {
    pub fn answers(answers: &[bool]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            asked: Cell::new(0),
        }
    }

    /// A prompt that must never be consulted.
    pub fn panicking() -> Self {
        Self::answers(&[])
    }

    pub fn asked(&self) -> usize {
        self.asked.get()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&self, message: &str) -> Result<bool, PlacerError> {
        self.asked.set(self.asked.get() + 1);
        match self.answers.borrow_mut().pop_front() {
            Some(answer) => Ok(answer),
            None => panic!("unexpected prompt: {message}"),
        }
    }

    fn input(&self, _message: &str, default: &str) -> Result<String, PlacerError> {
        Ok(default.to_string())
    }
}

/// Entry kinds understood by [`write_zip`].
pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8], u32),
    Symlink(&'a str, &'a str),
}

pub fn write_zip(path: &Path, entries: &[Entry]) {
    let file = File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);

    for entry in entries {
        match entry {
            Entry::Dir(name) => {
                zip.add_directory(*name, SimpleFileOptions::default().unix_permissions(0o755))
                    .unwrap();
            }
            Entry::File(name, data, mode) => {
                zip.start_file(*name, SimpleFileOptions::default().unix_permissions(*mode))
                    .unwrap();
                zip.write_all(data).unwrap();
            }
            Entry::Symlink(name, target) => {
                zip.add_symlink(*name, *target, SimpleFileOptions::default())
                    .unwrap();
            }
        }
    }

    zip.finish().unwrap();
}

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

/// Append-only transcript for one chain. With a non-zero window only the most
/// recent `window` turns are kept and replayed.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    window: usize,
}

impl ConversationMemory {
    pub fn new(window: usize) -> Self {
        Self { turns: VecDeque::new(), window }
    }

    pub fn seeded(window: usize, history: impl IntoIterator<Item = Turn>) -> Self {
        let mut memory = Self::new(window);
        for turn in history {
            memory.push(turn);
        }
        memory
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        if self.window > 0 {
            while self.turns.len() > self.window {
                self.turns.pop_front();
            }
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// "Human: ...\nAssistant: ..." rendering used by the question-condensing prompt.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for t in &self.turns {
            out.push_str("Human: ");
            out.push_str(&t.user);
            out.push_str("\nAssistant: ");
            out.push_str(&t.assistant);
            out.push('\n');
        }
        out
    }
}

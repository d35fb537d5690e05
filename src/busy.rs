use crate::sreg::StatusRegister;

/// Busy-poll states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollState {
    /// The device reported write-in-progress on the last read, or has not been read yet.
    Polling,
    /// The device reported ready. Terminal.
    Ready,
}

/// Tracks status reads while waiting for a write operation to complete.
///
/// Starts `Polling` once an erase or program is issued; each status read
/// either leaves it there or moves it to the terminal `Ready` state.
#[derive(Clone, Debug)]
pub struct BusyPoll {
    state: PollState,
    polls: usize,
    max_polls: Option<usize>,
}

impl BusyPoll {
    /// Start polling. `max_polls` of `None` polls forever.
    pub fn new(max_polls: Option<usize>) -> Self {
        BusyPoll { state: PollState::Polling, polls: 0, max_polls }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Number of status reads consumed so far.
    pub fn polls(&self) -> usize {
        self.polls
    }

    /// True once the poll budget is spent without reaching `Ready`.
    pub fn exhausted(&self) -> bool {
        match self.max_polls {
            Some(max) => self.state == PollState::Polling && self.polls >= max,
            None => false,
        }
    }

    /// Feed one freshly read status register value.
    ///
    /// Once `Ready`, further values are ignored.
    pub fn step(&mut self, status: StatusRegister) -> PollState {
        if self.state == PollState::Ready {
            return self.state;
        }
        self.polls += 1;
        if !status.get_busy() {
            self.state = PollState::Ready;
        }
        self.state
    }
}

#[test]
fn test_ready_after_leading_busy_values() {
    let statuses = [0x01, 0x03, 0x01, 0x00, 0x01];
    let mut poll = BusyPoll::new(None);
    let mut iter = statuses.iter();
    while poll.state() == PollState::Polling {
        poll.step(StatusRegister(*iter.next().unwrap()));
    }
    // Three busy values then ready.
    assert_eq!(poll.polls(), 4);
    assert_eq!(poll.step(StatusRegister(0x01)), PollState::Ready);
    assert_eq!(poll.polls(), 4);
}

#[test]
fn test_only_bit0_means_busy() {
    let mut poll = BusyPoll::new(None);
    // WEL set but not busy is ready.
    assert_eq!(poll.step(StatusRegister(0x02)), PollState::Ready);
    assert_eq!(poll.polls(), 1);
}

#[test]
fn test_budget_exhausted() {
    let mut poll = BusyPoll::new(Some(3));
    for _ in 0..3 {
        assert!(!poll.exhausted());
        poll.step(StatusRegister(0x01));
    }
    assert!(poll.exhausted());

    let mut poll = BusyPoll::new(Some(1));
    poll.step(StatusRegister(0x00));
    assert!(!poll.exhausted());
}

/// Desired/current pair with a single in-flight guard.
///
/// The public API only ever writes the desired side; confirmed responses and
/// events are the only writers of the current side. Reconciliation asks
/// `take_request` for at most one corrective request per divergence; the
/// matching response must call `complete` so the guard clears whether the
/// backend accepted the change or not.
#[derive(Debug, Clone)]
pub struct Convergent<T> {
    desired: T,
    current: T,
    in_flight: bool,
}

impl<T: Clone + PartialEq> Convergent<T> {
    pub fn new(initial: T) -> Self {
        Self {
            desired: initial.clone(),
            current: initial,
            in_flight: false,
        }
    }

    pub fn desired(&self) -> &T {
        &self.desired
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn set_desired(&mut self, value: T) {
        self.desired = value;
    }

    /// Returns the value to request when diverged and nothing is pending,
    /// marking the divergence in progress.
    pub fn take_request(&mut self) -> Option<T> {
        if self.in_flight || self.desired == self.current {
            return None;
        }
        self.in_flight = true;
        Some(self.desired.clone())
    }

    /// Applies a response for `requested` (the value echoed back by the
    /// transport). On success the confirmed value becomes current. On
    /// failure the rejected value is returned for the failure callback, and
    /// desired rolls back to current only if it still matches the rejected
    /// request, so a newer intent set meanwhile is not stomped.
    pub fn complete(&mut self, success: bool, requested: &T) -> Option<T> {
        self.in_flight = false;
        if success {
            self.current = requested.clone();
            None
        } else if self.desired == *requested {
            self.desired = self.current.clone();
            Some(requested.clone())
        } else {
            Some(requested.clone())
        }
    }

    /// Folds in a value observed from an unsolicited event. Desired follows
    /// along unless a local change is pending or already diverged.
    pub fn observe(&mut self, value: T) {
        if !self.in_flight && self.desired == self.current {
            self.desired = value.clone();
        }
        self.current = value;
    }
}

#[cfg(test)]
#[path = "tests/convergent_tests.rs"]
mod tests;

//! This is an internal module that contains utility functionality used by other modules.

/// Run a busy loop while `$cond` holds, giving up after `$max` iterations.
///
/// On timeout, the enclosing function returns `Err($err.into())`. `$err` is only evaluated
/// on timeout, so it may have side effects, eg aborting the peripheral. The optional block
/// runs once per iteration.
///
/// Example: `bounded_loop!(self.is_busy(), QspiError::Timeout(Wait::Idle), max_iters);`
macro_rules! bounded_loop {
    ($cond:expr, $err:expr, $max:expr) => {
        $crate::util::bounded_loop!($cond, $err, $max, {})
    };
    ($cond:expr, $err:expr, $max:expr, $code:block) => {
        let max: u32 = $max;
        let mut i: u32 = 0;
        while $cond {
            $code
            i += 1;
            if i >= max {
                return Err($err.into());
            }
        }
    };
}

pub(crate) use bounded_loop;

#[cfg(test)]
mod tests {
    fn count_down(mut n: u32, max: u32) -> Result<u32, &'static str> {
        let mut polls = 0;
        bounded_loop!(n > 0, "timed out", max, {
            n -= 1;
            polls += 1;
        });
        Ok(polls)
    }

    #[test]
    fn finishes_within_budget() {
        assert_eq!(count_down(5, 10), Ok(5));
        assert_eq!(count_down(0, 1), Ok(0));
    }

    #[test]
    fn times_out() {
        assert_eq!(count_down(50, 10), Err("timed out"));
    }
}

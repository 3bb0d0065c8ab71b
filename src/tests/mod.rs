/*
The session tests are organized into the same binary in this directory.

1) For speed (no external linking required)
2) For access to internals, the sessions run against in-memory backends
3) So we can compile the library crate with cfg(test) - we use that

See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 */

mod common;
mod rwsplit_test;
mod history_replay_test;
mod kill_test;
mod pool_test;

//
// Copyright 2020 Joyent, Inc.
//

//! Test data and helpers shared by the unit and integration tests.

pub mod test_data;
pub mod util;

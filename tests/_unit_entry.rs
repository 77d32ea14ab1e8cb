// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

mod unit_tests {
    mod test_codec;
    mod test_frame;
    mod test_naming;
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod dirty_log_tests;

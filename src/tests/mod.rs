mod tone_selftest;

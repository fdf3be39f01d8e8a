mod iforest;
